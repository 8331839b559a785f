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

use crate::model::location::LocationConfig;
use crate::model::secret::Secret;
use crate::newtype_uuid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

newtype_uuid!(MonitorId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorKind {
    Http,
    Website,
    Ping,
    Port,
    Ssl,
    Synthetic,
}

impl Display for MonitorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            MonitorKind::Http => "http",
            MonitorKind::Website => "website",
            MonitorKind::Ping => "ping",
            MonitorKind::Port => "port",
            MonitorKind::Ssl => "ssl",
            MonitorKind::Synthetic => "synthetic",
        };
        write!(f, "{s}")
    }
}

/// Aggregate status of a monitor. Mutated only by the aggregator; the REST
/// surface owns everything else about the spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Pending,
    Paused,
    Up,
    Down,
    Error,
}

impl MonitorStatus {
    /// Transitions out of these states never alert; there is no previous
    /// live verdict to compare against.
    pub fn is_boot_or_pause(&self) -> bool {
        matches!(self, MonitorStatus::Pending | MonitorStatus::Paused)
    }
}

impl Display for MonitorStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            MonitorStatus::Pending => "pending",
            MonitorStatus::Paused => "paused",
            MonitorStatus::Up => "up",
            MonitorStatus::Down => "down",
            MonitorStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl FromStr for MonitorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MonitorStatus::Pending),
            "paused" => Ok(MonitorStatus::Paused),
            "up" => Ok(MonitorStatus::Up),
            "down" => Ok(MonitorStatus::Down),
            "error" => Ok(MonitorStatus::Error),
            _ => Err(format!("Invalid monitor status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    Tcp,
    Udp,
}

impl Display for PortProtocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PortProtocol::Tcp => write!(f, "tcp"),
            PortProtocol::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorAuth {
    pub username: String,
    pub password: Secret,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertConfig {
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub alert_on_failure: bool,
    #[serde(default = "default_true")]
    pub alert_on_recovery: bool,
    #[serde(default)]
    pub alert_on_ssl_expiration: bool,
    /// Consecutive failed runs required before the first failure alert.
    #[serde(default = "default_alert_threshold")]
    pub failure_threshold: u32,
    /// Consecutive successful runs required before the first recovery alert.
    #[serde(default = "default_alert_threshold")]
    pub recovery_threshold: u32,
}

fn default_true() -> bool {
    true
}

fn default_alert_threshold() -> u32 {
    1
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            alert_on_failure: true,
            alert_on_recovery: true,
            alert_on_ssl_expiration: false,
            failure_threshold: default_alert_threshold(),
            recovery_threshold: default_alert_threshold(),
        }
    }
}

/// A monitor definition as dispatched to the regional queues. Created and
/// edited by the REST surface; the execution fabric reads it and only ever
/// writes back `status`, `last_check_at` and `last_status_change_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSpec {
    pub id: MonitorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<uuid::Uuid>,
    pub name: String,
    pub target: String,
    pub kind: MonitorKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Expected-status expression: wildcards (`2xx`), ranges (`200-204`)
    /// and comma-separated exact codes. Empty means 200-299.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_status_codes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub request_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<MonitorAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword_in_body: Option<String>,
    #[serde(default = "default_true")]
    pub keyword_in_body_should_be_present: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<PortProtocol>,
    #[serde(default)]
    pub expect_closed: bool,

    #[serde(default = "default_true")]
    pub enable_ssl_check: bool,
    #[serde(default = "default_ssl_warning_threshold")]
    pub ssl_warning_threshold_days: i64,
    /// Base SSL re-check frequency in seconds when the certificate is far
    /// from expiry. The probe tightens this to hourly/6-hourly bands as the
    /// expiry approaches.
    #[serde(default = "default_ssl_check_frequency")]
    pub ssl_check_frequency_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ssl_check_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic_test_id: Option<uuid::Uuid>,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub location: LocationConfig,
    #[serde(default)]
    pub alerts: AlertConfig,

    pub status: MonitorStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status_change_at: Option<DateTime<Utc>>,
}

fn default_ssl_warning_threshold() -> i64 {
    30
}

fn default_ssl_check_frequency() -> u64 {
    86_400
}

fn default_timeout_seconds() -> u64 {
    30
}

impl MonitorSpec {
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_seconds * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "id": "9f0c64a2-9e8b-4ab7-b35b-fb98bd23847e",
            "name": "homepage",
            "target": "https://example.com",
            "kind": "website",
            "status": "pending"
        })
    }

    #[test]
    fn defaults_are_applied_on_deserialization() {
        let spec: MonitorSpec = serde_json::from_value(minimal_json()).unwrap();
        assert_eq!(spec.timeout_seconds, 30);
        assert_eq!(spec.ssl_warning_threshold_days, 30);
        assert!(spec.enable_ssl_check);
        assert!(spec.keyword_in_body_should_be_present);
        assert!(!spec.location.enabled);
        assert_eq!(spec.alerts.failure_threshold, 1);
    }

    #[test]
    fn status_round_trips() {
        for status in [
            MonitorStatus::Pending,
            MonitorStatus::Paused,
            MonitorStatus::Up,
            MonitorStatus::Down,
            MonitorStatus::Error,
        ] {
            let parsed: MonitorStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
