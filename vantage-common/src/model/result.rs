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

use crate::model::location::LocationCode;
use crate::model::monitor::MonitorId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Up,
    Down,
    Timeout,
    Error,
}

impl Display for ResultStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultStatus::Up => "up",
            ResultStatus::Down => "down",
            ResultStatus::Timeout => "timeout",
            ResultStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ResultStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(ResultStatus::Up),
            "down" => Ok(ResultStatus::Down),
            "timeout" => Ok(ResultStatus::Timeout),
            "error" => Ok(ResultStatus::Error),
            _ => Err(format!("Invalid result status: {s}")),
        }
    }
}

/// What a probe runner hands back to the worker loop: verdict, structured
/// details for the result row, and elapsed wall time in whole milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeOutcome {
    pub status: ResultStatus,
    pub is_up: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ProbeOutcome {
    pub fn up(response_time_ms: Option<u64>, details: serde_json::Value) -> Self {
        Self {
            status: ResultStatus::Up,
            is_up: true,
            response_time_ms,
            details,
        }
    }

    pub fn down(response_time_ms: Option<u64>, details: serde_json::Value) -> Self {
        Self {
            status: ResultStatus::Down,
            is_up: false,
            response_time_ms,
            details,
        }
    }

    pub fn timeout(response_time_ms: Option<u64>, details: serde_json::Value) -> Self {
        Self {
            status: ResultStatus::Timeout,
            is_up: false,
            response_time_ms,
            details,
        }
    }

    pub fn error(details: serde_json::Value) -> Self {
        Self {
            status: ResultStatus::Error,
            is_up: false,
            response_time_ms: None,
            details,
        }
    }
}

/// One row in the append-only per-(monitor, location) result series.
///
/// Counter invariants: the consecutive counter of one polarity resets to
/// zero when `is_up` flips; the alert counters reset when the opposite
/// consecutive counter starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorResultRecord {
    pub monitor_id: MonitorId,
    pub location: LocationCode,
    pub checked_at: DateTime<Utc>,
    pub status: ResultStatus,
    pub is_up: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_group_id: Option<ExecutionGroupId>,
    pub consecutive_failure_count: u32,
    pub consecutive_success_count: u32,
    pub alerts_sent_for_failure: u32,
    pub alerts_sent_for_recovery: u32,
    pub is_status_change: bool,
}

impl MonitorResultRecord {
    /// Derives the new row's counters from the previous row in the same
    /// (monitor, location) series.
    pub fn next_counters(previous: Option<&MonitorResultRecord>, is_up: bool) -> ResultCounters {
        match previous {
            None => ResultCounters {
                consecutive_failure_count: u32::from(!is_up),
                consecutive_success_count: u32::from(is_up),
                alerts_sent_for_failure: 0,
                alerts_sent_for_recovery: 0,
                is_status_change: false,
            },
            Some(prev) => {
                let flipped = prev.is_up != is_up;
                if is_up {
                    ResultCounters {
                        consecutive_failure_count: 0,
                        consecutive_success_count: if flipped {
                            1
                        } else {
                            prev.consecutive_success_count + 1
                        },
                        alerts_sent_for_failure: 0,
                        alerts_sent_for_recovery: if flipped {
                            0
                        } else {
                            prev.alerts_sent_for_recovery
                        },
                        is_status_change: flipped,
                    }
                } else {
                    ResultCounters {
                        consecutive_failure_count: if flipped {
                            1
                        } else {
                            prev.consecutive_failure_count + 1
                        },
                        consecutive_success_count: 0,
                        alerts_sent_for_failure: if flipped {
                            0
                        } else {
                            prev.alerts_sent_for_failure
                        },
                        alerts_sent_for_recovery: 0,
                        is_status_change: flipped,
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCounters {
    pub consecutive_failure_count: u32,
    pub consecutive_success_count: u32,
    pub alerts_sent_for_failure: u32,
    pub alerts_sent_for_recovery: u32,
    pub is_status_change: bool,
}

/// Identifier shared by every per-location execution of one monitor tick.
/// Shape: `{monitor_id}-{epoch_ms}-{random_hex}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionGroupId(String);

impl ExecutionGroupId {
    pub fn generate(monitor_id: &MonitorId) -> Self {
        let nonce: u32 = rand::random();
        Self(format!(
            "{}-{}-{:08x}",
            monitor_id,
            Utc::now().timestamp_millis(),
            nonce
        ))
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the barrier set in the shared key-value store.
    pub fn barrier_key(&self) -> String {
        format!("barrier:{}", self.0)
    }
}

impl Display for ExecutionGroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const BARRIER_TTL_SECONDS: i64 = 120;

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;
    use uuid::Uuid;

    fn row(is_up: bool, counters: ResultCounters) -> MonitorResultRecord {
        MonitorResultRecord {
            monitor_id: MonitorId(Uuid::nil()),
            location: LocationCode::UsEast,
            checked_at: Utc::now(),
            status: if is_up {
                ResultStatus::Up
            } else {
                ResultStatus::Down
            },
            is_up,
            response_time_ms: None,
            details: serde_json::Value::Null,
            execution_group_id: None,
            consecutive_failure_count: counters.consecutive_failure_count,
            consecutive_success_count: counters.consecutive_success_count,
            alerts_sent_for_failure: counters.alerts_sent_for_failure,
            alerts_sent_for_recovery: counters.alerts_sent_for_recovery,
            is_status_change: counters.is_status_change,
        }
    }

    #[test]
    fn first_row_counts_itself() {
        let counters = MonitorResultRecord::next_counters(None, false);
        assert_eq!(counters.consecutive_failure_count, 1);
        assert_eq!(counters.consecutive_success_count, 0);
        assert!(!counters.is_status_change);
    }

    #[test]
    fn consecutive_counter_resets_on_flip() {
        let prev = row(
            false,
            ResultCounters {
                consecutive_failure_count: 4,
                consecutive_success_count: 0,
                alerts_sent_for_failure: 2,
                alerts_sent_for_recovery: 0,
                is_status_change: false,
            },
        );
        let counters = MonitorResultRecord::next_counters(Some(&prev), true);
        assert_eq!(counters.consecutive_failure_count, 0);
        assert_eq!(counters.consecutive_success_count, 1);
        assert_eq!(counters.alerts_sent_for_recovery, 0);
        assert!(counters.is_status_change);
    }

    #[test]
    fn failure_streak_accumulates() {
        let prev = row(
            false,
            ResultCounters {
                consecutive_failure_count: 2,
                consecutive_success_count: 0,
                alerts_sent_for_failure: 1,
                alerts_sent_for_recovery: 0,
                is_status_change: false,
            },
        );
        let counters = MonitorResultRecord::next_counters(Some(&prev), false);
        assert_eq!(counters.consecutive_failure_count, 3);
        assert_eq!(counters.alerts_sent_for_failure, 1);
        assert!(!counters.is_status_change);
    }

    #[test]
    fn group_id_embeds_monitor_id() {
        let monitor_id = MonitorId::new_v4();
        let group = ExecutionGroupId::generate(&monitor_id);
        assert!(group.as_str().starts_with(&monitor_id.to_string()));
        assert_eq!(group.barrier_key(), format!("barrier:{group}"));
    }
}
