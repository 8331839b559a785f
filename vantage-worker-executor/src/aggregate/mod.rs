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

//! Multi-location result aggregation. Each location persists its row, then
//! registers in the group's barrier set; the worker whose registration
//! completes the set is the unique aggregator for the tick.

pub mod alerts;

use crate::aggregate::alerts::AlertGate;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};
use vantage_common::model::{
    AggregationStrategy, ExecutionGroupId, LocationCode, MonitorResultRecord, MonitorSpec,
    MonitorStatus, ProbeOutcome, BARRIER_TTL_SECONDS,
};
use vantage_common::redis::RedisPool;
use vantage_service_base::repo::monitor::MonitorRepo;
use vantage_service_base::repo::monitor_result::MonitorResultRepo;
use vantage_service_base::repo::RepoError;

/// Barrier membership for execution groups, backed by the shared key-value
/// store. `register` must be atomic with respect to concurrent registrars:
/// exactly one caller observes the set reaching the expected size.
#[async_trait]
pub trait BarrierStore: Send + Sync {
    /// Adds `location` to the group's set and returns the resulting size.
    async fn register(
        &self,
        group: &ExecutionGroupId,
        location: LocationCode,
    ) -> Result<u64, String>;

    async fn delete(&self, group: &ExecutionGroupId) -> Result<(), String>;
}

pub struct RedisBarrierStore {
    pool: RedisPool,
}

impl RedisBarrierStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BarrierStore for RedisBarrierStore {
    async fn register(
        &self,
        group: &ExecutionGroupId,
        location: LocationCode,
    ) -> Result<u64, String> {
        let key = group.barrier_key();
        self.pool
            .sadd(&key, location.as_str())
            .await
            .map_err(|err| err.to_string())?;
        self.pool
            .expire(&key, Duration::from_secs(BARRIER_TTL_SECONDS as u64))
            .await
            .map_err(|err| err.to_string())?;
        let count = self
            .pool
            .scard(&key)
            .await
            .map_err(|err| err.to_string())?;
        Ok(count.max(0) as u64)
    }

    async fn delete(&self, group: &ExecutionGroupId) -> Result<(), String> {
        self.pool
            .del(&group.barrier_key())
            .await
            .map_err(|err| err.to_string())?;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryBarrierStore {
    sets: Mutex<HashMap<String, HashSet<LocationCode>>>,
}

impl InMemoryBarrierStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BarrierStore for InMemoryBarrierStore {
    async fn register(
        &self,
        group: &ExecutionGroupId,
        location: LocationCode,
    ) -> Result<u64, String> {
        let mut sets = self.sets.lock().unwrap();
        let set = sets.entry(group.barrier_key()).or_default();
        set.insert(location);
        Ok(set.len() as u64)
    }

    async fn delete(&self, group: &ExecutionGroupId) -> Result<(), String> {
        self.sets.lock().unwrap().remove(&group.barrier_key());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOutcome {
    Up,
    /// Some locations up; collapses to down for monitor status purposes.
    Partial,
    Down,
}

impl AggregateOutcome {
    pub fn is_up(&self) -> bool {
        matches!(self, AggregateOutcome::Up)
    }

    pub fn as_monitor_status(&self) -> MonitorStatus {
        match self {
            AggregateOutcome::Up => MonitorStatus::Up,
            AggregateOutcome::Partial | AggregateOutcome::Down => MonitorStatus::Down,
        }
    }
}

/// Combines per-location verdicts according to the monitor's strategy.
pub fn evaluate_aggregate(
    strategy: AggregationStrategy,
    threshold_percent: u8,
    location_statuses: &HashMap<LocationCode, bool>,
) -> AggregateOutcome {
    if location_statuses.is_empty() {
        return AggregateOutcome::Down;
    }

    let total = location_statuses.len();
    let up = location_statuses.values().filter(|up| **up).count();

    match strategy {
        AggregationStrategy::All => {
            if up == total {
                AggregateOutcome::Up
            } else if up > 0 {
                AggregateOutcome::Partial
            } else {
                AggregateOutcome::Down
            }
        }
        AggregationStrategy::Any => {
            if up > 0 {
                AggregateOutcome::Up
            } else {
                AggregateOutcome::Down
            }
        }
        AggregationStrategy::Majority => {
            let up_fraction_percent = up * 100 / total;
            if up_fraction_percent >= threshold_percent as usize {
                AggregateOutcome::Up
            } else if up > 0 {
                AggregateOutcome::Partial
            } else {
                AggregateOutcome::Down
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Grace period before the aggregator reads sibling rows; their
    /// database commits may land marginally after the barrier write.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error("repository error: {0}")]
    Repo(#[from] RepoError),
    #[error("barrier error: {0}")]
    Barrier(String),
}

pub struct ResultAggregator {
    monitors: Arc<dyn MonitorRepo>,
    results: Arc<dyn MonitorResultRepo>,
    barrier: Arc<dyn BarrierStore>,
    alert_gate: Arc<AlertGate>,
    config: AggregationConfig,
}

impl ResultAggregator {
    pub fn new(
        monitors: Arc<dyn MonitorRepo>,
        results: Arc<dyn MonitorResultRepo>,
        barrier: Arc<dyn BarrierStore>,
        alert_gate: Arc<AlertGate>,
        config: AggregationConfig,
    ) -> Self {
        Self {
            monitors,
            results,
            barrier,
            alert_gate,
            config,
        }
    }

    /// Persists this location's result and, when it is the last expected
    /// location to report, computes the aggregate verdict, transitions the
    /// monitor status and drives the alert gate.
    pub async fn save_distributed_result(
        &self,
        monitor: &MonitorSpec,
        location: LocationCode,
        outcome: &ProbeOutcome,
        group: &ExecutionGroupId,
        expected_locations: &[LocationCode],
    ) -> Result<(), AggregationError> {
        let previous_row = self
            .results
            .latest_for_location(&monitor.id, location)
            .await?;
        let previous_record = previous_row
            .and_then(|row| MonitorResultRecord::try_from(row).ok());
        let counters = MonitorResultRecord::next_counters(previous_record.as_ref(), outcome.is_up);

        let mut details = outcome.details.clone();
        if !details.is_object() {
            details = serde_json::json!({});
        }
        details["executionGroupId"] = serde_json::Value::String(group.to_string());
        details["expectedLocations"] = serde_json::to_value(expected_locations)
            .unwrap_or(serde_json::Value::Null);
        let streak_started_with_flip = if counters.is_status_change {
            true
        } else {
            previous_record
                .as_ref()
                .filter(|previous| previous.is_up == outcome.is_up)
                .map(|previous| {
                    previous
                        .details
                        .get("streakStartedWithStatusChange")
                        .and_then(|flag| flag.as_bool())
                        .unwrap_or(false)
                })
                .unwrap_or(false)
        };
        details["streakStartedWithStatusChange"] =
            serde_json::Value::Bool(streak_started_with_flip);

        let record = MonitorResultRecord {
            monitor_id: monitor.id,
            location,
            checked_at: Utc::now(),
            status: outcome.status,
            is_up: outcome.is_up,
            response_time_ms: outcome.response_time_ms,
            details,
            execution_group_id: Some(group.clone()),
            consecutive_failure_count: counters.consecutive_failure_count,
            consecutive_success_count: counters.consecutive_success_count,
            alerts_sent_for_failure: counters.alerts_sent_for_failure,
            alerts_sent_for_recovery: counters.alerts_sent_for_recovery,
            is_status_change: counters.is_status_change,
        };

        // The row must be durable before the barrier registration; the
        // aggregator reads rows, not messages.
        self.results.insert(&record).await?;

        let reported = self
            .barrier
            .register(group, location)
            .await
            .map_err(AggregationError::Barrier)?;

        if reported < expected_locations.len() as u64 {
            debug!(
                monitor = %monitor.id,
                %group,
                reported,
                expected = expected_locations.len(),
                "Not the last location; aggregation deferred"
            );
            return Ok(());
        }

        self.aggregate(monitor, location, &record, group, expected_locations)
            .await
    }

    async fn aggregate(
        &self,
        monitor: &MonitorSpec,
        location: LocationCode,
        own_record: &MonitorResultRecord,
        group: &ExecutionGroupId,
        expected_locations: &[LocationCode],
    ) -> Result<(), AggregationError> {
        tokio::time::sleep(self.config.settle_delay).await;

        let rows = self
            .results
            .latest_per_location_for_group(&monitor.id, group)
            .await?;
        if let Err(err) = self.barrier.delete(group).await {
            warn!(%group, error = %err, "Failed to delete barrier key");
        }

        let mut location_statuses: HashMap<LocationCode, bool> = HashMap::new();
        for row in &rows {
            match LocationCode::from_str(&row.location) {
                Ok(code) => {
                    location_statuses.insert(code, row.is_up);
                }
                Err(_) => warn!(location = %row.location, "Result row with unknown location"),
            }
        }
        // A location that never wrote its row (crash inside the barrier
        // TTL) counts as down rather than blocking the verdict.
        for expected in expected_locations {
            location_statuses.entry(*expected).or_insert(false);
        }

        let aggregate = evaluate_aggregate(
            monitor.location.strategy,
            monitor.location.threshold,
            &location_statuses,
        );

        let now = Utc::now();
        let previous_status = self
            .monitors
            .get(&monitor.id.0)
            .await?
            .and_then(|record| record.status.parse::<MonitorStatus>().ok())
            .unwrap_or(monitor.status);
        let new_status = aggregate.as_monitor_status();

        info!(
            monitor = %monitor.id,
            %group,
            ?aggregate,
            %previous_status,
            %new_status,
            locations = location_statuses.len(),
            "Aggregated execution group"
        );

        if previous_status != new_status {
            self.monitors
                .update_status(&monitor.id.0, &new_status.to_string(), &now)
                .await?;
        }
        self.monitors.update_last_check(&monitor.id.0, &now).await?;

        self.alert_gate
            .on_aggregated_result(
                monitor,
                previous_status,
                aggregate.is_up(),
                location,
                own_record,
            )
            .await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    fn statuses(entries: &[(LocationCode, bool)]) -> HashMap<LocationCode, bool> {
        entries.iter().copied().collect()
    }

    #[test]
    fn majority_strategy_uses_the_threshold() {
        let two_of_three = statuses(&[
            (LocationCode::UsEast, true),
            (LocationCode::EuCentral, true),
            (LocationCode::AsiaPacific, false),
        ]);
        assert_eq!(
            evaluate_aggregate(AggregationStrategy::Majority, 50, &two_of_three),
            AggregateOutcome::Up
        );
        assert_eq!(
            evaluate_aggregate(AggregationStrategy::Majority, 80, &two_of_three),
            AggregateOutcome::Partial
        );

        let none_up = statuses(&[
            (LocationCode::UsEast, false),
            (LocationCode::EuCentral, false),
        ]);
        assert_eq!(
            evaluate_aggregate(AggregationStrategy::Majority, 50, &none_up),
            AggregateOutcome::Down
        );
    }

    #[test]
    fn all_strategy_requires_every_location() {
        let one_down = statuses(&[
            (LocationCode::UsEast, true),
            (LocationCode::EuCentral, true),
            (LocationCode::AsiaPacific, false),
        ]);
        assert_eq!(
            evaluate_aggregate(AggregationStrategy::All, 50, &one_down),
            AggregateOutcome::Partial
        );
        assert_eq!(
            evaluate_aggregate(AggregationStrategy::All, 50, &one_down).as_monitor_status(),
            MonitorStatus::Down
        );

        let all_up = statuses(&[
            (LocationCode::UsEast, true),
            (LocationCode::EuCentral, true),
        ]);
        assert_eq!(
            evaluate_aggregate(AggregationStrategy::All, 50, &all_up),
            AggregateOutcome::Up
        );
    }

    #[test]
    fn any_strategy_needs_a_single_up() {
        let one_up = statuses(&[
            (LocationCode::UsEast, false),
            (LocationCode::EuCentral, true),
        ]);
        assert_eq!(
            evaluate_aggregate(AggregationStrategy::Any, 50, &one_up),
            AggregateOutcome::Up
        );

        let none = statuses(&[(LocationCode::UsEast, false)]);
        assert_eq!(
            evaluate_aggregate(AggregationStrategy::Any, 50, &none),
            AggregateOutcome::Down
        );
    }

    #[test]
    fn empty_group_is_down() {
        assert_eq!(
            evaluate_aggregate(AggregationStrategy::Majority, 50, &HashMap::new()),
            AggregateOutcome::Down
        );
    }

    #[test]
    async fn barrier_registration_counts_members_once() {
        let barrier = InMemoryBarrierStore::new();
        let group = ExecutionGroupId::from_string("m-1-abc");
        assert_eq!(
            barrier.register(&group, LocationCode::UsEast).await.unwrap(),
            1
        );
        assert_eq!(
            barrier.register(&group, LocationCode::UsEast).await.unwrap(),
            1
        );
        assert_eq!(
            barrier
                .register(&group, LocationCode::EuCentral)
                .await
                .unwrap(),
            2
        );
        barrier.delete(&group).await.unwrap();
        assert_eq!(
            barrier.register(&group, LocationCode::UsEast).await.unwrap(),
            1
        );
    }
}
