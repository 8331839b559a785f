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
use std::fmt::Write;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    pub json: bool,
    pub ansi: bool,
    pub with_time: bool,
    /// Directive used when `RUST_LOG` is unset.
    pub default_directive: String,
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            json: false,
            ansi: true,
            with_time: true,
            default_directive: "info".to_string(),
        }
    }

    pub fn production(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            json: true,
            ansi: false,
            with_time: true,
            default_directive: "info".to_string(),
        }
    }

    pub fn test_pretty_without_time(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            json: false,
            ansi: true,
            with_time: false,
            default_directive: "debug".to_string(),
        }
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(json) = std::env::var("VANTAGE_TRACING_JSON") {
            self.json = json == "1" || json.eq_ignore_ascii_case("true");
        }
        if let Ok(directive) = std::env::var("VANTAGE_TRACING_DEFAULT_DIRECTIVE") {
            self.default_directive = directive;
        }
        self
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::local_dev("vantage")
    }
}

impl SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "service name: {}", self.service_name);
        let _ = writeln!(&mut result, "json: {}", self.json);
        let _ = writeln!(&mut result, "default directive: {}", self.default_directive);
        result
    }
}

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive.to_string()))
}

/// Installs the global subscriber. Safe to call more than once; later calls
/// are ignored (tests share one process).
pub fn init_tracing_with_default_env_filter(config: &TracingConfig) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(&config.default_directive))
        .with_ansi(config.ansi);

    let result = if config.json {
        builder.json().try_init()
    } else if config.with_time {
        builder.try_init()
    } else {
        builder.without_time().try_init()
    };

    if result.is_ok() {
        tracing::info!(service = %config.service_name, "Tracing initialized");
    }
}

pub fn init_tracing_with_default_debug_env_filter(config: &TracingConfig) {
    let mut config = config.clone();
    config.default_directive = "debug".to_string();
    init_tracing_with_default_env_filter(&config);
}
