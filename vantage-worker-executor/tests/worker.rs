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
use test_r::{inherit_test_dep, test};
use uuid::Uuid;
use vantage_common::model::{JobType, K6Job, LocationCode, RunId, RunStatus, CANCELLED_BY_USER};
use vantage_common::queue::consumer::{JobDisposition, JobHandler};
use vantage_common::queue::{LeasedJob, QueueName};
use vantage_service_base::clients::billing::StaticBillingService;
use vantage_service_base::clients::notification::InMemoryNotificationService;
use vantage_service_base::repo::run::InMemoryRunRepo;
use vantage_service_base::storage::InMemoryArtifactStorage;
use vantage_worker_executor::container::executor::{ContainerExecutor, ContainerRuntimeConfig};
use vantage_worker_executor::k6::{K6Runner, K6RunnerConfig};
use vantage_worker_executor::services::active_runs::ActiveRunRegistry;
use vantage_worker_executor::services::cancellation::{
    CancellationStore, InMemoryCancellationStore,
};
use vantage_worker_executor::worker::{K6JobHandler, WorkerLocation};

inherit_test_dep!(Tracing);

struct K6Harness {
    handler: K6JobHandler,
    runs: Arc<InMemoryRunRepo>,
    cancellation: Arc<InMemoryCancellationStore>,
    notifications: Arc<InMemoryNotificationService>,
    billing: Arc<StaticBillingService>,
}

fn k6_harness() -> K6Harness {
    let cancellation = Arc::new(InMemoryCancellationStore::new());
    let active_runs = Arc::new(ActiveRunRegistry::new());
    let executor = Arc::new(ContainerExecutor::new(
        ContainerRuntimeConfig::default(),
        cancellation.clone(),
        active_runs.clone(),
    ));
    let runner = Arc::new(K6Runner::new(
        K6RunnerConfig::default(),
        executor,
        active_runs,
        Arc::new(InMemoryArtifactStorage::new()),
        None,
    ));
    let runs = Arc::new(InMemoryRunRepo::new());
    let billing = Arc::new(StaticBillingService::allowing());
    let notifications = Arc::new(InMemoryNotificationService::new());

    let handler = K6JobHandler {
        worker_location: WorkerLocation::Region(LocationCode::UsEast),
        enable_location_filtering: true,
        runner,
        runs: runs.clone(),
        billing: billing.clone(),
        cancellation: cancellation.clone(),
        notifications: notifications.clone(),
    };

    K6Harness {
        handler,
        runs,
        cancellation,
        notifications,
        billing,
    }
}

fn k6_leased_job(run_id: RunId) -> LeasedJob {
    let job = K6Job {
        run_id,
        job_id: Some(Uuid::new_v4()),
        test_id: Uuid::new_v4(),
        script: "ZXhwb3J0IGRlZmF1bHQgZnVuY3Rpb24gKCkge30=".to_string(),
        tests: vec![],
        organization_id: Uuid::new_v4(),
        project_id: Uuid::new_v4(),
        location: Some("us-east".to_string()),
        job_type: JobType::K6,
    };
    LeasedJob {
        job_id: run_id.to_string(),
        payload: serde_json::to_value(&job).unwrap(),
        attempts_made: 1,
        max_attempts: 3,
        lease_token: "lease".to_string(),
    }
}

#[test]
async fn cancelled_runs_are_dropped_before_execution_and_never_retried(_tracing: &Tracing) {
    let harness = k6_harness();
    let run_id = RunId::new_v4();
    harness.cancellation.set_cancellation(&run_id).await;

    let disposition = harness
        .handler
        .handle(
            QueueName::K6Region(LocationCode::UsEast),
            &k6_leased_job(run_id),
        )
        .await;

    assert_eq!(
        disposition,
        JobDisposition::Discard(CANCELLED_BY_USER.to_string())
    );

    let record = harness.runs.get_record(&run_id).unwrap();
    assert_eq!(record.status, RunStatus::Error);
    assert_eq!(record.error_details.as_deref(), Some(CANCELLED_BY_USER));

    // Pre-flight drop consumes the flag.
    assert!(!harness.cancellation.is_cancelled(&run_id).await);
}

#[test]
async fn blocked_organizations_get_a_blocked_run_and_a_notice(_tracing: &Tracing) {
    let harness = k6_harness();
    harness.billing.set(
        vantage_service_base::clients::billing::BillingDecision::Blocked {
            reason: "plan limit reached".to_string(),
        },
    );

    let run_id = RunId::new_v4();
    let disposition = harness
        .handler
        .handle(
            QueueName::K6Region(LocationCode::UsEast),
            &k6_leased_job(run_id),
        )
        .await;

    assert_eq!(disposition, JobDisposition::Complete);

    let record = harness.runs.get_record(&run_id).unwrap();
    assert_eq!(record.status, RunStatus::Blocked);
    assert_eq!(record.error_details.as_deref(), Some("plan limit reached"));
    assert_eq!(harness.notifications.sent().len(), 1);
}

#[test]
async fn malformed_payloads_are_discarded(_tracing: &Tracing) {
    let harness = k6_harness();
    let leased = LeasedJob {
        job_id: "broken".to_string(),
        payload: serde_json::json!({ "not": "a k6 job" }),
        attempts_made: 1,
        max_attempts: 3,
        lease_token: "lease".to_string(),
    };

    let disposition = harness
        .handler
        .handle(QueueName::K6Global, &leased)
        .await;
    assert!(matches!(disposition, JobDisposition::Discard(_)));
}
