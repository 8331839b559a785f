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

//! The regional worker loop: one worker process parameterized by its
//! location, consuming the regional monitor queue plus the execution
//! queues its deployment subscribes it to.

use crate::aggregate::ResultAggregator;
use crate::k6::{K6Runner, K6Task};
use crate::metrics;
use crate::probes::MonitorProber;
use crate::services::cancellation::CancellationStore;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use vantage_common::model::{
    JobType, K6Job, LocationCode, MonitorJob, PlaywrightJob, RunRecord, RunStatus,
    CANCELLED_BY_USER, TEST_KIND_PERFORMANCE,
};
use vantage_common::queue::consumer::{JobDisposition, JobHandler};
use vantage_common::queue::{LeasedJob, QueueName};
use vantage_service_base::clients::billing::{BillingDecision, BillingService};
use vantage_service_base::clients::notification::{Notification, NotificationService};
use vantage_service_base::clients::playwright::{PlaywrightClient, PlaywrightExecutionRequest};
use vantage_service_base::repo::run::RunRepo;

/// Where this worker replica runs. `local` is the development mode that
/// subscribes to every regional queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLocation {
    Local,
    Region(LocationCode),
}

impl WorkerLocation {
    /// In production an unrecognized location is a deployment bug and must
    /// fail startup; in development it degrades to `local` with a warning.
    pub fn parse(raw: &str, production: bool) -> Result<WorkerLocation, String> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("local") {
            return Ok(WorkerLocation::Local);
        }
        match LocationCode::from_str(&trimmed.to_lowercase()) {
            Ok(code) => Ok(WorkerLocation::Region(code)),
            Err(_) if production => Err(format!(
                "invalid worker location {trimmed:?}; expected local, us-east, eu-central or asia-pacific"
            )),
            Err(_) => {
                warn!(location = trimmed, "Unknown worker location, falling back to local");
                Ok(WorkerLocation::Local)
            }
        }
    }

    /// The location results are attributed to when a job carries a
    /// wildcard.
    pub fn effective_code(&self) -> LocationCode {
        match self {
            WorkerLocation::Local => LocationCode::DEFAULT,
            WorkerLocation::Region(code) => *code,
        }
    }

    pub fn monitor_queues(&self) -> Vec<QueueName> {
        match self {
            WorkerLocation::Local => QueueName::all_monitor_regions(),
            WorkerLocation::Region(code) => vec![QueueName::MonitorRegion(*code)],
        }
    }

    pub fn k6_queues(&self, mode: K6QueueMode) -> Vec<QueueName> {
        match (self, mode) {
            (_, K6QueueMode::Global) => vec![QueueName::K6Global],
            (WorkerLocation::Local, K6QueueMode::Regional) => QueueName::all_k6_regions(),
            (WorkerLocation::Region(code), K6QueueMode::Regional) => {
                vec![QueueName::K6Region(*code)]
            }
        }
    }
}

/// Whether k6 workers bind to their regional queue or share the global
/// pool; chosen per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum K6QueueMode {
    Global,
    #[default]
    Regional,
}

/// Warn-and-process location filter. Rejecting a mismatched job after its
/// retries are exhausted would lose it permanently, so a mismatch is never
/// fatal.
fn check_location_filter(
    worker_location: WorkerLocation,
    filtering_enabled: bool,
    job_location: Option<&str>,
) -> LocationCode {
    let Some(raw) = job_location else {
        return worker_location.effective_code();
    };
    let raw = raw.trim();
    if raw.is_empty() || LocationCode::is_wildcard(raw) {
        return worker_location.effective_code();
    }

    let target = LocationCode::normalize(raw);
    if filtering_enabled {
        if let WorkerLocation::Region(own) = worker_location {
            if own != target {
                warn!(
                    job_location = raw,
                    worker_location = %own,
                    "Job location does not match this worker; processing anyway"
                );
            }
        }
    }
    target
}

pub struct MonitorJobHandler {
    pub worker_location: WorkerLocation,
    pub enable_location_filtering: bool,
    pub prober: Arc<MonitorProber>,
    pub aggregator: Arc<ResultAggregator>,
}

#[async_trait]
impl JobHandler for MonitorJobHandler {
    async fn handle(&self, queue: QueueName, job: &LeasedJob) -> JobDisposition {
        let monitor_job: MonitorJob = match job.payload_as() {
            Ok(parsed) => parsed,
            Err(err) => return JobDisposition::Discard(err.to_string()),
        };

        let location = check_location_filter(
            self.worker_location,
            self.enable_location_filtering,
            Some(&monitor_job.execution_location),
        );

        let monitor = &monitor_job.config;
        let organization_id = monitor.organization_id.unwrap_or_else(Uuid::nil);

        info!(
            %queue,
            monitor = %monitor.id,
            kind = %monitor.kind,
            %location,
            group = %monitor_job.execution_group_id,
            "Running monitor check"
        );
        let timer = metrics::probe_timer(&monitor.kind.to_string());
        let outcome = self.prober.run(monitor, location, &organization_id).await;
        drop(timer);
        metrics::record_probe_outcome(&monitor.kind.to_string(), outcome.is_up);

        match self
            .aggregator
            .save_distributed_result(
                monitor,
                location,
                &outcome,
                &monitor_job.execution_group_id,
                &monitor_job.expected_locations,
            )
            .await
        {
            Ok(()) => JobDisposition::Complete,
            Err(err) => {
                error!(monitor = %monitor.id, error = %err, "Failed to persist monitor result");
                JobDisposition::Retry(err.to_string())
            }
        }
    }
}

pub struct K6JobHandler {
    pub worker_location: WorkerLocation,
    pub enable_location_filtering: bool,
    pub runner: Arc<K6Runner>,
    pub runs: Arc<dyn RunRepo>,
    pub billing: Arc<dyn BillingService>,
    pub cancellation: Arc<dyn CancellationStore>,
    pub notifications: Arc<dyn NotificationService>,
}

#[async_trait]
impl JobHandler for K6JobHandler {
    async fn handle(&self, queue: QueueName, job: &LeasedJob) -> JobDisposition {
        let k6_job: K6Job = match job.payload_as() {
            Ok(parsed) => parsed,
            Err(err) => return JobDisposition::Discard(err.to_string()),
        };
        if k6_job.job_type != JobType::K6 {
            return JobDisposition::Discard(format!(
                "job {} routed to {queue} is not a k6 job",
                job.job_id
            ));
        }

        let location = check_location_filter(
            self.worker_location,
            self.enable_location_filtering,
            k6_job.location.as_deref(),
        );
        let run_id = k6_job.run_id;

        // Dropped before any resources are spent; the user asked for it.
        if self.cancellation.is_cancelled(&run_id).await {
            self.cancellation.clear_cancellation(&run_id).await;
            self.finish_run(run_id, location, RunStatus::Error, |record| {
                record.error_details = Some(CANCELLED_BY_USER.to_string());
            })
            .await;
            return JobDisposition::Discard(CANCELLED_BY_USER.to_string());
        }

        match self
            .billing
            .check_execution_allowed(&k6_job.organization_id)
            .await
        {
            Ok(BillingDecision::Allowed) => {}
            Ok(BillingDecision::Blocked { reason }) => {
                self.finish_run(run_id, location, RunStatus::Blocked, |record| {
                    record.error_details = Some(reason.clone());
                })
                .await;
                let _ = self
                    .notifications
                    .notify(Notification::RunBlocked { run_id, reason })
                    .await;
                return JobDisposition::Complete;
            }
            Err(err) => {
                warn!(%run_id, error = %err, "Billing gate unavailable, allowing execution");
            }
        }

        let record = RunRecord::new_running(run_id, k6_job.job_id, location);
        if let Err(err) = self.runs.update(&record).await {
            warn!(%run_id, error = %err, "Failed to mark run as running");
        }

        metrics::EXECUTIONS_STARTED
            .with_label_values(&["k6"])
            .inc();

        let task = K6Task {
            run_id,
            test_id: k6_job.test_id,
            script_base64: k6_job.script.clone(),
            organization_id: k6_job.organization_id,
            timeout_ms: None,
        };
        let outcome = self.runner.run_k6(&task).await;

        let status = if outcome.cancelled {
            RunStatus::Error
        } else if outcome.success {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        };
        metrics::record_execution_finished("k6", status == RunStatus::Passed);

        let headline = outcome.headline.clone();
        let report_url = outcome.report_url.clone();
        let logs_url = outcome.console_url.clone();
        let duration_ms = outcome.duration_ms;
        let error_details = if outcome.cancelled {
            Some(CANCELLED_BY_USER.to_string())
        } else if outcome.timed_out {
            Some("execution timed out".to_string())
        } else {
            outcome.error.clone()
        };
        let thresholds_passed = outcome.thresholds_passed;

        self.finish_run(run_id, location, status, move |record| {
            record.duration_ms = Some(duration_ms);
            record.report_url = report_url.clone();
            record.logs_url = logs_url.clone();
            record.error_details = error_details.clone();
            // Derived performance numbers ride on the run record.
            record.metadata = serde_json::json!({
                "thresholdsPassed": thresholds_passed,
                "performance": headline,
            });
        })
        .await;

        if outcome.cancelled {
            JobDisposition::Discard(CANCELLED_BY_USER.to_string())
        } else if outcome.timed_out {
            JobDisposition::Retry("execution timed out".to_string())
        } else {
            JobDisposition::Complete
        }
    }
}

impl K6JobHandler {
    async fn finish_run<F>(
        &self,
        run_id: vantage_common::model::RunId,
        location: LocationCode,
        status: RunStatus,
        mutate: F,
    ) where
        F: FnOnce(&mut RunRecord),
    {
        let mut record = RunRecord::new_running(run_id, None, location);
        record.status = status;
        record.completed_at = Some(Utc::now());
        mutate(&mut record);
        // Persistence is best-effort; the queue still records the outcome.
        if let Err(err) = self.runs.update(&record).await {
            error!(%run_id, error = %err, "Failed to persist run outcome");
        }
    }
}

pub struct PlaywrightJobHandler {
    pub worker_location: WorkerLocation,
    pub runs: Arc<dyn RunRepo>,
    pub billing: Arc<dyn BillingService>,
    pub cancellation: Arc<dyn CancellationStore>,
    pub playwright: Arc<dyn PlaywrightClient>,
    pub notifications: Arc<dyn NotificationService>,
}

#[async_trait]
impl JobHandler for PlaywrightJobHandler {
    async fn handle(&self, _queue: QueueName, job: &LeasedJob) -> JobDisposition {
        let pw_job: PlaywrightJob = match job.payload_as() {
            Ok(parsed) => parsed,
            Err(err) => return JobDisposition::Discard(err.to_string()),
        };

        let run_id = pw_job.run_id;
        let location = self.worker_location.effective_code();

        if self.cancellation.is_cancelled(&run_id).await {
            self.cancellation.clear_cancellation(&run_id).await;
            let mut record = RunRecord::new_running(run_id, Some(pw_job.job_id), location);
            record.status = RunStatus::Error;
            record.completed_at = Some(Utc::now());
            record.error_details = Some(CANCELLED_BY_USER.to_string());
            let _ = self.runs.update(&record).await;
            return JobDisposition::Discard(CANCELLED_BY_USER.to_string());
        }

        match self
            .billing
            .check_execution_allowed(&pw_job.organization_id)
            .await
        {
            Ok(BillingDecision::Allowed) => {}
            Ok(BillingDecision::Blocked { reason }) => {
                let mut record = RunRecord::new_running(run_id, Some(pw_job.job_id), location);
                record.status = RunStatus::Blocked;
                record.completed_at = Some(Utc::now());
                record.error_details = Some(reason.clone());
                let _ = self.runs.update(&record).await;
                let _ = self
                    .notifications
                    .notify(Notification::RunBlocked { run_id, reason })
                    .await;
                return JobDisposition::Complete;
            }
            Err(err) => {
                warn!(%run_id, error = %err, "Billing gate unavailable, allowing execution");
            }
        }

        let record = RunRecord::new_running(run_id, Some(pw_job.job_id), location);
        let _ = self.runs.update(&record).await;
        metrics::EXECUTIONS_STARTED
            .with_label_values(&["playwright"])
            .inc();

        let mut all_passed = true;
        let mut total_duration = 0u64;
        let mut first_report_url = None;
        let mut first_error: Option<String> = None;

        for script in &pw_job.test_scripts {
            let body = match BASE64
                .decode(script.script.as_bytes())
                .map_err(|err| err.to_string())
                .and_then(|bytes| String::from_utf8(bytes).map_err(|err| err.to_string()))
            {
                Ok(body) => body,
                Err(err) => {
                    all_passed = false;
                    first_error
                        .get_or_insert(format!("test {} is not valid base64: {err}", script.name));
                    continue;
                }
            };

            let request = PlaywrightExecutionRequest {
                run_id,
                test_name: script.name.clone(),
                script: body,
                variables: pw_job.variables.clone(),
                secrets: pw_job.secrets.clone(),
                bypass_concurrency_check: false,
                unique_execution_id: false,
            };

            match self.playwright.execute_test(request).await {
                Ok(result) => {
                    total_duration += result.duration_ms;
                    if first_report_url.is_none() {
                        first_report_url = result.report_url.clone();
                    }
                    if !result.success {
                        all_passed = false;
                        if let Some(error) = result.error {
                            first_error.get_or_insert(error);
                        }
                    }
                }
                Err(err) => {
                    let mut record = RunRecord::new_running(run_id, Some(pw_job.job_id), location);
                    record.status = RunStatus::Failed;
                    record.completed_at = Some(Utc::now());
                    record.error_details = Some(err.to_string());
                    let _ = self.runs.update(&record).await;
                    metrics::record_execution_finished("playwright", false);
                    return JobDisposition::Retry(err.to_string());
                }
            }
        }

        let mut record = RunRecord::new_running(run_id, Some(pw_job.job_id), location);
        record.status = if all_passed {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        };
        record.completed_at = Some(Utc::now());
        record.duration_ms = Some(total_duration);
        record.report_url = first_report_url;
        record.error_details = first_error;
        let _ = self.runs.update(&record).await;
        metrics::record_execution_finished("playwright", all_passed);

        JobDisposition::Complete
    }
}

/// Per-queue-kind consumer concurrency. k6 stays at one per process
/// regardless of configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerQueuesConfig {
    pub monitor_concurrency: usize,
    pub playwright_concurrency: usize,
}

impl Default for WorkerQueuesConfig {
    fn default() -> Self {
        Self {
            monitor_concurrency: 8,
            playwright_concurrency: 2,
        }
    }
}

pub fn validate_k6_performance_tests(
    tests: &[vantage_common::model::TestScript],
) -> Result<(), String> {
    let performance_count = tests
        .iter()
        .filter(|test| test.kind == TEST_KIND_PERFORMANCE)
        .count();
    if performance_count != 1 || tests.len() != 1 {
        return Err("k6 jobs require performance tests".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;
    use vantage_common::model::TestScript;

    #[test]
    fn worker_location_parsing() {
        assert_eq!(
            WorkerLocation::parse("local", false).unwrap(),
            WorkerLocation::Local
        );
        assert_eq!(
            WorkerLocation::parse("us-east", true).unwrap(),
            WorkerLocation::Region(LocationCode::UsEast)
        );
        assert!(WorkerLocation::parse("moon-base", true).is_err());
        assert_eq!(
            WorkerLocation::parse("moon-base", false).unwrap(),
            WorkerLocation::Local
        );
    }

    #[test]
    fn queue_subscriptions_follow_location_and_mode() {
        let regional = WorkerLocation::Region(LocationCode::UsEast);
        assert_eq!(
            regional.monitor_queues(),
            vec![QueueName::MonitorRegion(LocationCode::UsEast)]
        );
        assert_eq!(
            regional.k6_queues(K6QueueMode::Regional),
            vec![QueueName::K6Region(LocationCode::UsEast)]
        );
        assert_eq!(
            regional.k6_queues(K6QueueMode::Global),
            vec![QueueName::K6Global]
        );

        assert_eq!(WorkerLocation::Local.monitor_queues().len(), 3);
        assert_eq!(
            WorkerLocation::Local.k6_queues(K6QueueMode::Regional).len(),
            3
        );
    }

    #[test]
    fn wildcards_resolve_to_the_worker_location() {
        let worker = WorkerLocation::Region(LocationCode::AsiaPacific);
        assert_eq!(
            check_location_filter(worker, true, Some("*")),
            LocationCode::AsiaPacific
        );
        assert_eq!(
            check_location_filter(worker, true, Some("any")),
            LocationCode::AsiaPacific
        );
        assert_eq!(
            check_location_filter(worker, true, None),
            LocationCode::AsiaPacific
        );
    }

    #[test]
    fn mismatched_location_is_processed_with_its_own_attribution() {
        let worker = WorkerLocation::Region(LocationCode::UsEast);
        // The job's intended location wins so the barrier set completes
        // with the expected member.
        assert_eq!(
            check_location_filter(worker, true, Some("eu-central")),
            LocationCode::EuCentral
        );
        assert_eq!(
            check_location_filter(worker, false, Some("EU_CENTRAL")),
            LocationCode::EuCentral
        );
    }

    #[test]
    fn k6_jobs_require_exactly_one_performance_test() {
        let performance = TestScript {
            id: Uuid::new_v4(),
            name: "load".to_string(),
            kind: "performance".to_string(),
            script: "e30=".to_string(),
        };
        let browser = TestScript {
            id: Uuid::new_v4(),
            name: "ui".to_string(),
            kind: "browser".to_string(),
            script: "e30=".to_string(),
        };

        assert!(validate_k6_performance_tests(std::slice::from_ref(&performance)).is_ok());
        assert!(validate_k6_performance_tests(&[browser.clone()]).is_err());
        assert!(validate_k6_performance_tests(&[performance.clone(), browser]).is_err());
        assert!(validate_k6_performance_tests(&[]).is_err());
    }
}
