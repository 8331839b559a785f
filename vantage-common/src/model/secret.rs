// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Debug, Display, Formatter};

pub const SECRET_PLACEHOLDER: &str = "[SECRET]";

/// A string value that renders masked on every generic formatting path.
/// Consumers that actually need the value must call [`Secret::reveal`]
/// explicitly; everything else (logs, error messages, debug dumps) goes
/// through [`Secret::render`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn render(&self) -> &'static str {
        SECRET_PLACEHOLDER
    }

    pub fn reveal(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl Debug for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl SafeDisplay for Secret {
    fn to_safe_string(&self) -> String {
        self.render().to_string()
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn formatting_never_leaks() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret}"), SECRET_PLACEHOLDER);
        assert_eq!(format!("{secret:?}"), SECRET_PLACEHOLDER);
        assert_eq!(secret.reveal(), "hunter2");
    }

    #[test]
    fn serde_round_trips_the_real_value() {
        let secret = Secret::new("api-key-123");
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, "\"api-key-123\"");
        let back: Secret = serde_json::from_str(&json).unwrap();
        assert_eq!(back.reveal(), "api-key-123");
    }
}
