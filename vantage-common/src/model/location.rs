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

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use strum_macros::EnumIter;

/// The closed set of execution regions. Every queue name, barrier member and
/// result row is keyed by one of these codes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum LocationCode {
    UsEast,
    EuCentral,
    AsiaPacific,
}

impl LocationCode {
    /// Fallback region for unknown codes and for monitors with location
    /// routing disabled.
    pub const DEFAULT: LocationCode = LocationCode::EuCentral;

    pub fn as_str(&self) -> &'static str {
        match self {
            LocationCode::UsEast => "us-east",
            LocationCode::EuCentral => "eu-central",
            LocationCode::AsiaPacific => "asia-pacific",
        }
    }

    pub fn all() -> [LocationCode; 3] {
        [
            LocationCode::UsEast,
            LocationCode::EuCentral,
            LocationCode::AsiaPacific,
        ]
    }

    /// Maps any historical spelling (`US`, `US_EAST`, `us east`, `europe`,
    /// `apac`, ...) into the closed set. Unknown inputs fall back to
    /// [`LocationCode::DEFAULT`]. Idempotent: normalizing an already canonical
    /// code returns it unchanged.
    pub fn normalize(input: &str) -> LocationCode {
        Self::try_normalize(input).unwrap_or(LocationCode::DEFAULT)
    }

    pub fn try_normalize(input: &str) -> Option<LocationCode> {
        let canonical = input.trim().to_lowercase().replace(['_', ' '], "-");
        match canonical.as_str() {
            "us-east" | "us" | "useast" | "us-east-1" | "north-america" => {
                Some(LocationCode::UsEast)
            }
            "eu-central" | "eu" | "eucentral" | "eu-central-1" | "europe" => {
                Some(LocationCode::EuCentral)
            }
            "asia-pacific" | "asia" | "ap" | "apac" | "asiapacific" | "ap-southeast-1" => {
                Some(LocationCode::AsiaPacific)
            }
            _ => None,
        }
    }

    /// `*` and `any` in a job's location mean "whatever location this worker
    /// runs in".
    pub fn is_wildcard(input: &str) -> bool {
        let trimmed = input.trim();
        trimmed == "*" || trimmed.eq_ignore_ascii_case("any")
    }
}

impl Display for LocationCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LocationCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "us-east" => Ok(LocationCode::UsEast),
            "eu-central" => Ok(LocationCode::EuCentral),
            "asia-pacific" => Ok(LocationCode::AsiaPacific),
            _ => Err(format!("Invalid location code: {s}")),
        }
    }
}

/// How the per-location verdicts of one execution group combine into the
/// monitor's aggregate status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationStrategy {
    All,
    Any,
    #[default]
    Majority,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationConfig {
    pub enabled: bool,
    #[serde(default)]
    pub locations: Vec<LocationCode>,
    /// Percentage of locations that must be up for the majority strategy.
    #[serde(default = "default_threshold")]
    pub threshold: u8,
    #[serde(default)]
    pub strategy: AggregationStrategy,
}

fn default_threshold() -> u8 {
    50
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            locations: Vec::new(),
            threshold: default_threshold(),
            strategy: AggregationStrategy::default(),
        }
    }
}

impl LocationConfig {
    /// The locations a monitor tick fans out to. A disabled config (or an
    /// enabled one that violates the non-empty invariant) collapses to the
    /// single default region.
    pub fn effective_locations(&self) -> Vec<LocationCode> {
        if !self.enabled || self.locations.is_empty() {
            return vec![LocationCode::DEFAULT];
        }
        let mut locations = self.locations.clone();
        locations.sort();
        locations.dedup();
        locations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn normalization_maps_legacy_spellings() {
        assert_eq!(LocationCode::normalize("US"), LocationCode::UsEast);
        assert_eq!(LocationCode::normalize("US_EAST"), LocationCode::UsEast);
        assert_eq!(LocationCode::normalize("us east"), LocationCode::UsEast);
        assert_eq!(LocationCode::normalize("Europe"), LocationCode::EuCentral);
        assert_eq!(LocationCode::normalize("APAC"), LocationCode::AsiaPacific);
        assert_eq!(
            LocationCode::normalize("mars-base-1"),
            LocationCode::EuCentral
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        for input in ["US", "eu central", "apac", "garbage", "us-east"] {
            let once = LocationCode::normalize(input);
            let twice = LocationCode::normalize(once.as_str());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn wildcards() {
        assert!(LocationCode::is_wildcard("*"));
        assert!(LocationCode::is_wildcard("any"));
        assert!(LocationCode::is_wildcard("ANY"));
        assert!(!LocationCode::is_wildcard("us-east"));
    }

    #[test]
    fn disabled_config_uses_default_primary() {
        let config = LocationConfig::default();
        assert_eq!(config.effective_locations(), vec![LocationCode::EuCentral]);
    }

    #[test]
    fn enabled_config_dedups_and_sorts() {
        let config = LocationConfig {
            enabled: true,
            locations: vec![
                LocationCode::AsiaPacific,
                LocationCode::UsEast,
                LocationCode::AsiaPacific,
            ],
            threshold: 50,
            strategy: AggregationStrategy::Majority,
        };
        assert_eq!(
            config.effective_locations(),
            vec![LocationCode::UsEast, LocationCode::AsiaPacific]
        );
    }
}
