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

//! Fan-out of fired triggers onto the execution queues. Cron evaluation
//! happens upstream; by the time a message reaches the dispatcher the only
//! decisions left are which queues receive it and under which group id.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use vantage_common::model::{
    ExecutionGroupId, JobTrigger, JobType, K6Job, K6TestRef, LocationCode, MonitorJob,
    MonitorSpec, MonitorStatus, PlaywrightJob, RunRecord, RunStatus, TriggerKind,
    TEST_KIND_PERFORMANCE,
};
use vantage_common::queue::{EnqueueOutcome, JobOptions, JobQueue, QueueError, QueueName};
use vantage_service_base::repo::run::RunRepo;
use vantage_service_base::repo::RepoError;

pub const K6_JOB_VALIDATION_ERROR: &str = "k6 jobs require performance tests";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("repository error: {0}")]
    Repo(#[from] RepoError),
    #[error("invalid job: {0}")]
    InvalidJob(String),
}

#[derive(Debug, Clone)]
pub struct DispatchedGroup {
    pub execution_group_id: ExecutionGroupId,
    pub locations: Vec<LocationCode>,
    pub enqueued: usize,
    pub deduplicated: usize,
}

/// Fans a monitor tick out to one message per effective location, all
/// sharing a freshly minted execution group id.
pub struct MonitorDispatcher {
    queue: Arc<dyn JobQueue>,
}

impl MonitorDispatcher {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    pub async fn dispatch_monitor_tick(
        &self,
        monitor: &MonitorSpec,
        retry_limit: u32,
    ) -> Result<Option<DispatchedGroup>, DispatchError> {
        if monitor.status == MonitorStatus::Paused {
            info!(monitor = %monitor.id, "Monitor is paused; tick dropped");
            return Ok(None);
        }

        let locations = monitor.location.effective_locations();
        let execution_group_id = ExecutionGroupId::generate(&monitor.id);

        let options = JobOptions::monitor()
            .with_attempts(retry_limit)
            .with_backoff_base(Duration::from_secs(5))
            .with_priority(10);

        let mut enqueued = 0;
        let mut deduplicated = 0;

        for location in &locations {
            let job = MonitorJob {
                monitor_id: monitor.id,
                kind: monitor.kind,
                target: monitor.target.clone(),
                config: monitor.clone(),
                execution_location: location.as_str().to_string(),
                execution_group_id: execution_group_id.clone(),
                expected_locations: locations.clone(),
                retry_limit,
            };

            let payload = serde_json::to_value(&job)
                .map_err(|err| DispatchError::InvalidJob(err.to_string()))?;

            match self
                .queue
                .enqueue(
                    QueueName::MonitorRegion(*location),
                    &job.dedup_id(),
                    payload,
                    &options,
                )
                .await?
            {
                EnqueueOutcome::Enqueued => enqueued += 1,
                EnqueueOutcome::Deduplicated => deduplicated += 1,
            }
        }

        info!(
            monitor = %monitor.id,
            group = %execution_group_id,
            locations = locations.len(),
            enqueued,
            deduplicated,
            "Monitor tick dispatched"
        );

        Ok(Some(DispatchedGroup {
            execution_group_id,
            locations,
            enqueued,
            deduplicated,
        }))
    }
}

/// Routes Playwright and k6 triggers by their `jobType` tag, creating the
/// run record before the message is visible to any worker.
pub struct JobDispatcher {
    queue: Arc<dyn JobQueue>,
    runs: Arc<dyn RunRepo>,
}

impl JobDispatcher {
    pub fn new(queue: Arc<dyn JobQueue>, runs: Arc<dyn RunRepo>) -> Self {
        Self { queue, runs }
    }

    pub async fn dispatch_job(&self, trigger: &JobTrigger) -> Result<(), DispatchError> {
        let location = trigger
            .location
            .as_deref()
            .filter(|raw| !raw.trim().is_empty() && !LocationCode::is_wildcard(raw))
            .map(LocationCode::normalize);

        let mut record = RunRecord::new_running(
            trigger.run_id,
            Some(trigger.job_id),
            location.unwrap_or(LocationCode::DEFAULT),
        );
        self.runs.create(&record).await?;

        match trigger.job_type {
            JobType::K6 => {
                if let Err(message) = validate_k6_trigger(trigger) {
                    record.status = RunStatus::Failed;
                    record.completed_at = Some(Utc::now());
                    record.error_details = Some(message.clone());
                    self.runs.update(&record).await?;
                    warn!(run = %trigger.run_id, "k6 trigger rejected: {message}");
                    return Err(DispatchError::InvalidJob(message));
                }
                self.dispatch_k6(trigger, location).await
            }
            JobType::Playwright => self.dispatch_playwright(trigger).await,
        }
    }

    async fn dispatch_k6(
        &self,
        trigger: &JobTrigger,
        location: Option<LocationCode>,
    ) -> Result<(), DispatchError> {
        let script = &trigger.test_scripts[0];

        let job = K6Job {
            run_id: trigger.run_id,
            job_id: Some(trigger.job_id),
            test_id: script.id,
            script: script.script.clone(),
            tests: vec![K6TestRef {
                id: script.id,
                script: script.script.clone(),
            }],
            organization_id: trigger.organization_id,
            project_id: trigger.project_id,
            location: location.map(|code| code.as_str().to_string()),
            job_type: JobType::K6,
        };

        // Regional queue when the trigger pins a location, shared global
        // pool otherwise.
        let queue = match location {
            Some(code) => QueueName::K6Region(code),
            None => QueueName::K6Global,
        };

        let payload = serde_json::to_value(&job)
            .map_err(|err| DispatchError::InvalidJob(err.to_string()))?;
        let options = JobOptions::execution().with_attempts(trigger.retry_limit);
        self.queue
            .enqueue(queue, &trigger.job_id.to_string(), payload, &options)
            .await?;

        info!(run = %trigger.run_id, %queue, "k6 job dispatched");
        Ok(())
    }

    async fn dispatch_playwright(&self, trigger: &JobTrigger) -> Result<(), DispatchError> {
        let job = PlaywrightJob {
            run_id: trigger.run_id,
            job_id: trigger.job_id,
            test_scripts: trigger.test_scripts.clone(),
            trigger: TriggerKind::Schedule,
            organization_id: trigger.organization_id,
            project_id: trigger.project_id,
            variables: trigger.resolved_variables.clone(),
            secrets: trigger.resolved_secrets.clone(),
            job_type: JobType::Playwright,
        };

        let payload = serde_json::to_value(&job)
            .map_err(|err| DispatchError::InvalidJob(err.to_string()))?;
        let options = JobOptions::execution().with_attempts(trigger.retry_limit);
        self.queue
            .enqueue(
                QueueName::PlaywrightGlobal,
                &trigger.job_id.to_string(),
                payload,
                &options,
            )
            .await?;

        info!(run = %trigger.run_id, "Playwright job dispatched");
        Ok(())
    }
}

fn validate_k6_trigger(trigger: &JobTrigger) -> Result<(), String> {
    let performance_count = trigger
        .test_scripts
        .iter()
        .filter(|test| test.kind == TEST_KIND_PERFORMANCE)
        .count();
    if trigger.test_scripts.len() != 1 || performance_count != 1 {
        return Err(K6_JOB_VALIDATION_ERROR.to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_r::test;
    use uuid::Uuid;
    use vantage_common::model::{RunId, TestScript};
    use vantage_common::queue::memory::InMemoryJobQueue;
    use vantage_service_base::repo::run::InMemoryRunRepo;

    fn monitor(locations: Vec<LocationCode>) -> MonitorSpec {
        let mut spec: MonitorSpec = serde_json::from_value(serde_json::json!({
            "id": "9f0c64a2-9e8b-4ab7-b35b-fb98bd23847e",
            "name": "api",
            "target": "https://api.example.com/health",
            "kind": "http",
            "status": "up"
        }))
        .unwrap();
        spec.location.enabled = !locations.is_empty();
        spec.location.locations = locations;
        spec
    }

    fn trigger(job_type: JobType, scripts: Vec<TestScript>) -> JobTrigger {
        JobTrigger {
            job_id: Uuid::new_v4(),
            run_id: RunId::new_v4(),
            job_type,
            organization_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            test_scripts: scripts,
            resolved_variables: HashMap::new(),
            resolved_secrets: HashMap::new(),
            location: None,
            retry_limit: 3,
        }
    }

    fn performance_script() -> TestScript {
        TestScript {
            id: Uuid::new_v4(),
            name: "load".to_string(),
            kind: "performance".to_string(),
            script: "ZXhwb3J0IGRlZmF1bHQgKCkgPT4ge30=".to_string(),
        }
    }

    #[test]
    async fn fan_out_covers_every_effective_location() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let dispatcher = MonitorDispatcher::new(queue.clone());
        let spec = monitor(vec![
            LocationCode::UsEast,
            LocationCode::EuCentral,
            LocationCode::AsiaPacific,
        ]);

        let group = dispatcher
            .dispatch_monitor_tick(&spec, 2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(group.enqueued, 3);
        assert_eq!(group.deduplicated, 0);

        for location in LocationCode::all() {
            let leased = queue
                .dequeue(
                    QueueName::MonitorRegion(location),
                    Duration::from_secs(60),
                )
                .await
                .unwrap()
                .expect("each regional queue got a message");
            let job: MonitorJob = leased.payload_as().unwrap();
            assert_eq!(job.execution_location, location.as_str());
            assert_eq!(job.execution_group_id, group.execution_group_id);
            assert_eq!(job.expected_locations.len(), 3);
            assert!(leased
                .job_id
                .starts_with(&format!("{}:", spec.id)));
        }
    }

    #[test]
    async fn disabled_location_config_targets_the_default_region() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let dispatcher = MonitorDispatcher::new(queue.clone());
        let spec = monitor(vec![]);

        let group = dispatcher
            .dispatch_monitor_tick(&spec, 2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(group.locations, vec![LocationCode::EuCentral]);
        assert_eq!(
            queue
                .depth(QueueName::MonitorRegion(LocationCode::EuCentral))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            queue
                .depth(QueueName::MonitorRegion(LocationCode::UsEast))
                .await
                .unwrap(),
            0
        );
    }

    #[test]
    async fn duplicate_ticks_are_deduplicated_per_group() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let dispatcher = MonitorDispatcher::new(queue.clone());
        let spec = monitor(vec![LocationCode::UsEast]);

        let first = dispatcher
            .dispatch_monitor_tick(&spec, 2)
            .await
            .unwrap()
            .unwrap();
        let second = dispatcher
            .dispatch_monitor_tick(&spec, 2)
            .await
            .unwrap()
            .unwrap();

        // Group ids differ, so both ticks enqueue; dedup protects against
        // the same group being dispatched twice.
        assert_ne!(first.execution_group_id, second.execution_group_id);
        assert_eq!(second.enqueued, 1);
    }

    #[test]
    async fn paused_monitors_are_not_dispatched() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let dispatcher = MonitorDispatcher::new(queue.clone());
        let mut spec = monitor(vec![LocationCode::UsEast]);
        spec.status = MonitorStatus::Paused;

        let group = dispatcher.dispatch_monitor_tick(&spec, 2).await.unwrap();
        assert!(group.is_none());
    }

    #[test]
    async fn k6_trigger_requires_a_single_performance_test() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let runs = Arc::new(InMemoryRunRepo::new());
        let dispatcher = JobDispatcher::new(queue.clone(), runs.clone());

        let browser_script = TestScript {
            id: Uuid::new_v4(),
            name: "ui".to_string(),
            kind: "browser".to_string(),
            script: "e30=".to_string(),
        };
        let bad = trigger(JobType::K6, vec![browser_script]);

        let result = dispatcher.dispatch_job(&bad).await;
        assert!(result.is_err());

        let record = runs.get_record(&bad.run_id).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(
            record.error_details.as_deref(),
            Some(K6_JOB_VALIDATION_ERROR)
        );
        assert_eq!(queue.depth(QueueName::K6Global).await.unwrap(), 0);
    }

    #[test]
    async fn k6_trigger_with_location_goes_to_the_regional_queue() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let runs = Arc::new(InMemoryRunRepo::new());
        let dispatcher = JobDispatcher::new(queue.clone(), runs.clone());

        let mut k6 = trigger(JobType::K6, vec![performance_script()]);
        k6.location = Some("US".to_string());

        dispatcher.dispatch_job(&k6).await.unwrap();

        assert_eq!(
            queue
                .depth(QueueName::K6Region(LocationCode::UsEast))
                .await
                .unwrap(),
            1
        );
        let record = runs.get_record(&k6.run_id).unwrap();
        assert_eq!(record.status, RunStatus::Running);
    }

    #[test]
    async fn playwright_trigger_goes_to_the_global_queue() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let runs = Arc::new(InMemoryRunRepo::new());
        let dispatcher = JobDispatcher::new(queue.clone(), runs.clone());

        let pw = trigger(
            JobType::Playwright,
            vec![TestScript {
                id: Uuid::new_v4(),
                name: "checkout".to_string(),
                kind: "browser".to_string(),
                script: "e30=".to_string(),
            }],
        );

        dispatcher.dispatch_job(&pw).await.unwrap();

        let leased = queue
            .dequeue(QueueName::PlaywrightGlobal, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        let job: PlaywrightJob = leased.payload_as().unwrap();
        assert_eq!(job.run_id, pw.run_id);
        assert_eq!(job.job_type, JobType::Playwright);
    }
}
