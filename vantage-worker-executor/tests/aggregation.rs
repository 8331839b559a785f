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

use crate::Tracing;
use std::sync::Arc;
use std::time::Duration;
use test_r::{inherit_test_dep, test};
use vantage_common::model::{
    AggregationStrategy, ExecutionGroupId, LocationCode, MonitorSpec, MonitorStatus, ProbeOutcome,
};
use vantage_service_base::clients::notification::{InMemoryNotificationService, Notification};
use vantage_service_base::repo::monitor::{InMemoryMonitorRepo, MonitorRepo};
use vantage_service_base::repo::monitor_result::InMemoryMonitorResultRepo;
use vantage_worker_executor::aggregate::alerts::{AlertGate, InMemoryAlertDebounce};
use vantage_worker_executor::aggregate::{
    AggregationConfig, InMemoryBarrierStore, ResultAggregator,
};

inherit_test_dep!(Tracing);

struct Harness {
    monitors: Arc<InMemoryMonitorRepo>,
    results: Arc<InMemoryMonitorResultRepo>,
    notifications: Arc<InMemoryNotificationService>,
    aggregator: ResultAggregator,
}

fn harness() -> Harness {
    let monitors = Arc::new(InMemoryMonitorRepo::new());
    let results = Arc::new(InMemoryMonitorResultRepo::new());
    let notifications = Arc::new(InMemoryNotificationService::new());
    let alert_gate = Arc::new(AlertGate::new(
        notifications.clone(),
        results.clone(),
        Arc::new(InMemoryAlertDebounce::new()),
    ));
    let aggregator = ResultAggregator::new(
        monitors.clone(),
        results.clone(),
        Arc::new(InMemoryBarrierStore::new()),
        alert_gate,
        AggregationConfig {
            settle_delay: Duration::from_millis(1),
        },
    );
    Harness {
        monitors,
        results,
        notifications,
        aggregator,
    }
}

fn three_location_monitor(
    strategy: AggregationStrategy,
    status: MonitorStatus,
    alert_on_failure: bool,
) -> MonitorSpec {
    let mut spec: MonitorSpec = serde_json::from_value(serde_json::json!({
        "id": "9f0c64a2-9e8b-4ab7-b35b-fb98bd23847e",
        "name": "api health",
        "target": "https://api.example.com/health",
        "kind": "http",
        "status": status.to_string()
    }))
    .unwrap();
    spec.location.enabled = true;
    spec.location.locations = vec![
        LocationCode::UsEast,
        LocationCode::EuCentral,
        LocationCode::AsiaPacific,
    ];
    spec.location.strategy = strategy;
    spec.location.threshold = 50;
    spec.alerts.enabled = true;
    spec.alerts.alert_on_failure = alert_on_failure;
    spec.alerts.failure_threshold = 1;
    spec
}

fn up() -> ProbeOutcome {
    ProbeOutcome::up(Some(120), serde_json::json!({ "statusCode": 200 }))
}

fn down() -> ProbeOutcome {
    ProbeOutcome::down(
        Some(300),
        serde_json::json!({ "statusCode": 503, "errorMessage": "unexpected status code 503" }),
    )
}

async fn run_group(
    harness: &Harness,
    monitor: &MonitorSpec,
    group: &ExecutionGroupId,
    verdicts: &[(LocationCode, bool)],
) {
    for (location, is_up) in verdicts {
        let outcome = if *is_up { up() } else { down() };
        harness
            .aggregator
            .save_distributed_result(
                monitor,
                *location,
                &outcome,
                group,
                &verdicts.iter().map(|(code, _)| *code).collect::<Vec<_>>(),
            )
            .await
            .expect("save_distributed_result failed");
    }
}

async fn monitor_status(harness: &Harness, monitor: &MonitorSpec) -> String {
    harness
        .monitors
        .get(&monitor.id.0)
        .await
        .unwrap()
        .unwrap()
        .status
}

#[test]
async fn majority_two_of_three_up_transitions_pending_to_up_without_alert(_tracing: &Tracing) {
    let harness = harness();
    let monitor = three_location_monitor(
        AggregationStrategy::Majority,
        MonitorStatus::Pending,
        true,
    );
    harness.monitors.insert_spec(&monitor);

    let group = ExecutionGroupId::generate(&monitor.id);
    run_group(
        &harness,
        &monitor,
        &group,
        &[
            (LocationCode::UsEast, true),
            (LocationCode::EuCentral, true),
            (LocationCode::AsiaPacific, false),
        ],
    )
    .await;

    assert_eq!(monitor_status(&harness, &monitor).await, "up");
    // First verdict ever: the transition out of pending never alerts.
    assert!(harness.notifications.sent().is_empty());
}

#[test]
async fn strategy_all_with_one_failure_goes_down_and_alerts_once(_tracing: &Tracing) {
    let harness = harness();
    let monitor =
        three_location_monitor(AggregationStrategy::All, MonitorStatus::Up, true);
    harness.monitors.insert_spec(&monitor);

    let group = ExecutionGroupId::generate(&monitor.id);
    run_group(
        &harness,
        &monitor,
        &group,
        &[
            (LocationCode::UsEast, true),
            (LocationCode::EuCentral, true),
            (LocationCode::AsiaPacific, false),
        ],
    )
    .await;

    assert_eq!(monitor_status(&harness, &monitor).await, "down");

    let sent = harness.notifications.sent();
    let failures: Vec<_> = sent
        .iter()
        .filter(|n| matches!(n, Notification::MonitorFailure { .. }))
        .collect();
    assert_eq!(failures.len(), 1);
}

#[test]
async fn aggregation_happens_only_after_the_last_location(_tracing: &Tracing) {
    let harness = harness();
    let monitor = three_location_monitor(
        AggregationStrategy::Majority,
        MonitorStatus::Pending,
        true,
    );
    harness.monitors.insert_spec(&monitor);

    let group = ExecutionGroupId::generate(&monitor.id);
    let expected = vec![
        LocationCode::UsEast,
        LocationCode::EuCentral,
        LocationCode::AsiaPacific,
    ];

    harness
        .aggregator
        .save_distributed_result(&monitor, LocationCode::UsEast, &up(), &group, &expected)
        .await
        .unwrap();

    // The row is durable before the barrier completes, but no aggregate
    // verdict exists yet.
    assert_eq!(harness.results.all_rows().len(), 1);
    assert_eq!(monitor_status(&harness, &monitor).await, "pending");

    harness
        .aggregator
        .save_distributed_result(&monitor, LocationCode::EuCentral, &up(), &group, &expected)
        .await
        .unwrap();
    assert_eq!(monitor_status(&harness, &monitor).await, "pending");

    harness
        .aggregator
        .save_distributed_result(
            &monitor,
            LocationCode::AsiaPacific,
            &up(),
            &group,
            &expected,
        )
        .await
        .unwrap();
    assert_eq!(monitor_status(&harness, &monitor).await, "up");
}

#[test]
async fn failure_alerts_are_capped_per_run(_tracing: &Tracing) {
    let harness = harness();
    let mut monitor =
        three_location_monitor(AggregationStrategy::Majority, MonitorStatus::Up, true);
    monitor.location.enabled = false;
    monitor.location.locations.clear();
    harness.monitors.insert_spec(&monitor);

    // A long unbroken failure run across many ticks.
    for _ in 0..30 {
        let group = ExecutionGroupId::generate(&monitor.id);
        run_group(
            &harness,
            &monitor,
            &group,
            &[(LocationCode::EuCentral, false)],
        )
        .await;
    }

    let failures: Vec<_> = harness
        .notifications
        .sent()
        .into_iter()
        .filter(|n| matches!(n, Notification::MonitorFailure { .. }))
        .collect();
    assert_eq!(failures.len(), 3, "no more than 3 alerts per failure run");
}

#[test]
async fn recovery_alert_fires_after_a_real_down_period(_tracing: &Tracing) {
    let harness = harness();
    let mut monitor =
        three_location_monitor(AggregationStrategy::Majority, MonitorStatus::Up, true);
    monitor.location.enabled = false;
    monitor.location.locations.clear();
    monitor.alerts.alert_on_recovery = true;
    monitor.alerts.recovery_threshold = 1;
    harness.monitors.insert_spec(&monitor);

    for is_up in [false, false, true] {
        let group = ExecutionGroupId::generate(&monitor.id);
        run_group(
            &harness,
            &monitor,
            &group,
            &[(LocationCode::EuCentral, is_up)],
        )
        .await;
    }

    assert_eq!(monitor_status(&harness, &monitor).await, "up");
    let recoveries: Vec<_> = harness
        .notifications
        .sent()
        .into_iter()
        .filter(|n| matches!(n, Notification::MonitorRecovery { .. }))
        .collect();
    assert_eq!(recoveries.len(), 1);
}

#[test]
async fn steadily_up_monitor_never_sends_recovery_alerts(_tracing: &Tracing) {
    let harness = harness();
    let mut monitor = three_location_monitor(
        AggregationStrategy::Majority,
        MonitorStatus::Pending,
        true,
    );
    monitor.location.enabled = false;
    monitor.location.locations.clear();
    monitor.alerts.recovery_threshold = 3;
    harness.monitors.insert_spec(&monitor);

    for _ in 0..10 {
        let group = ExecutionGroupId::generate(&monitor.id);
        run_group(
            &harness,
            &monitor,
            &group,
            &[(LocationCode::EuCentral, true)],
        )
        .await;
    }

    assert!(harness.notifications.sent().is_empty());
}

#[test]
async fn ssl_expiration_alert_is_debounced(_tracing: &Tracing) {
    let harness = harness();
    let mut monitor =
        three_location_monitor(AggregationStrategy::Majority, MonitorStatus::Up, false);
    monitor.location.enabled = false;
    monitor.location.locations.clear();
    monitor.alerts.alert_on_ssl_expiration = true;
    monitor.ssl_warning_threshold_days = 30;
    harness.monitors.insert_spec(&monitor);

    for _ in 0..3 {
        let group = ExecutionGroupId::generate(&monitor.id);
        let outcome = ProbeOutcome::up(
            Some(80),
            serde_json::json!({
                "statusCode": 200,
                "sslCertificate": { "daysRemaining": 10 },
                "warningMessage": "certificate expires in 10 days"
            }),
        );
        harness
            .aggregator
            .save_distributed_result(
                &monitor,
                LocationCode::EuCentral,
                &outcome,
                &group,
                &[LocationCode::EuCentral],
            )
            .await
            .unwrap();
    }

    let ssl_alerts: Vec<_> = harness
        .notifications
        .sent()
        .into_iter()
        .filter(|n| matches!(n, Notification::SslExpiration { .. }))
        .collect();
    assert_eq!(ssl_alerts.len(), 1, "one SSL notice per 24h window");
    if let Notification::SslExpiration { days_remaining, .. } = &ssl_alerts[0] {
        assert_eq!(*days_remaining, 10);
    }
}

#[test]
async fn group_rows_carry_the_group_id_and_expected_set(_tracing: &Tracing) {
    let harness = harness();
    let monitor = three_location_monitor(
        AggregationStrategy::Majority,
        MonitorStatus::Pending,
        false,
    );
    harness.monitors.insert_spec(&monitor);

    let group = ExecutionGroupId::generate(&monitor.id);
    run_group(
        &harness,
        &monitor,
        &group,
        &[
            (LocationCode::UsEast, true),
            (LocationCode::EuCentral, true),
            (LocationCode::AsiaPacific, true),
        ],
    )
    .await;

    let rows = harness.results.all_rows();
    assert_eq!(rows.len(), 3);
    for row in rows {
        assert_eq!(row.execution_group_id.as_deref(), Some(group.as_str()));
        let details: serde_json::Value = serde_json::from_str(&row.details).unwrap();
        assert_eq!(details["executionGroupId"], group.as_str());
        assert_eq!(
            details["expectedLocations"].as_array().unwrap().len(),
            3
        );
    }
}
