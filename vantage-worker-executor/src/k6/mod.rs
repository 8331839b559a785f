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

pub mod summary;

use crate::container::executor::ContainerExecutor;
use crate::container::{ContainerJob, NetworkMode, OutputChunk, OutputStream};
use crate::services::active_runs::{ActiveRunRegistry, RunKind};
use crate::services::ports::{AllocatedPort, DashboardPortConfig, DashboardPortPool};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use vantage_common::model::RunId;
use vantage_common::redis::RedisPool;
use vantage_service_base::storage::ArtifactStorage;

use summary::{compute_verdict, extract_headline_metrics, K6HeadlineMetrics, K6Summary};

pub const K6_SCRIPT_FILE: &str = "test.js";
pub const K6_SUMMARY_PATH: &str = "/tmp/summary.json";
pub const K6_METRICS_PATH: &str = "/tmp/metrics.json";
pub const K6_REPORT_EXPORT_PATH: &str = "/tmp/report/report.html";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct K6RunnerConfig {
    pub image: String,
    pub memory_mb: u64,
    pub cpu_fraction: f64,
    pub default_timeout_ms: u64,
    pub dashboard: DashboardPortConfig,
    pub max_dashboard_attempts: u32,
}

impl Default for K6RunnerConfig {
    fn default() -> Self {
        Self {
            image: "grafana/k6:latest".to_string(),
            memory_mb: 1536,
            cpu_fraction: 1.0,
            default_timeout_ms: 1_800_000,
            dashboard: DashboardPortConfig::default(),
            max_dashboard_attempts: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct K6Task {
    pub run_id: RunId,
    pub test_id: Uuid,
    /// Base64-encoded script body as carried on the queue.
    pub script_base64: String,
    pub organization_id: Uuid,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct K6RunOutcome {
    pub run_id: Option<RunId>,
    pub success: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration_ms: u64,
    pub thresholds_passed: bool,
    pub summary: Option<K6Summary>,
    pub headline: Option<K6HeadlineMetrics>,
    pub report_url: Option<String>,
    pub summary_url: Option<String>,
    pub console_url: Option<String>,
    pub console_output: Option<String>,
    pub error: Option<String>,
}

/// Wraps the container executor for k6 load tests: dashboard-port pool,
/// retry on port clashes, threshold verdict, artifact packaging, live
/// console streaming.
pub struct K6Runner {
    config: K6RunnerConfig,
    executor: Arc<ContainerExecutor>,
    ports: Arc<DashboardPortPool>,
    active_runs: Arc<ActiveRunRegistry>,
    storage: Arc<dyn ArtifactStorage>,
    console_publisher: Option<RedisPool>,
}

impl K6Runner {
    pub fn new(
        config: K6RunnerConfig,
        executor: Arc<ContainerExecutor>,
        active_runs: Arc<ActiveRunRegistry>,
        storage: Arc<dyn ArtifactStorage>,
        console_publisher: Option<RedisPool>,
    ) -> Self {
        Self {
            ports: Arc::new(DashboardPortPool::new(config.dashboard.clone())),
            config,
            executor,
            active_runs,
            storage,
            console_publisher,
        }
    }

    pub fn console_channel(run_id: &RunId) -> String {
        format!("k6:run:{run_id}:console")
    }

    pub async fn run_k6(&self, task: &K6Task) -> K6RunOutcome {
        let run_id = task.run_id;

        if let Err(err) = self.active_runs.register(run_id, RunKind::K6) {
            return K6RunOutcome {
                run_id: Some(run_id),
                error: Some(err.to_string()),
                ..Default::default()
            };
        }

        let outcome = self.run_registered(task).await;
        self.active_runs.deregister(&run_id);
        outcome
    }

    async fn run_registered(&self, task: &K6Task) -> K6RunOutcome {
        let run_id = task.run_id;

        let script = match BASE64.decode(task.script_base64.as_bytes()) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(script) => script,
                Err(err) => {
                    return Self::failed_before_launch(run_id, format!("script is not UTF-8: {err}"))
                }
            },
            Err(err) => {
                return Self::failed_before_launch(run_id, format!("script is not base64: {err}"))
            }
        };

        let mut attempt = 1;
        loop {
            let port = match self.ports.allocate().await {
                Ok(port) => port,
                Err(err) => return Self::failed_before_launch(run_id, err.to_string()),
            };
            if let AllocatedPort::Pooled(number) = port {
                self.active_runs.attach_dashboard_port(&run_id, number);
            }

            let outcome = self.run_attempt(task, &script, port).await;
            self.ports.release(port).await;

            let port_clash = Self::stderr_indicates_port_clash(outcome.stderr.as_deref());

            if port_clash && attempt < self.config.max_dashboard_attempts {
                attempt += 1;
                warn!(%run_id, attempt, "Dashboard port clash, retrying with a fresh port");
                continue;
            }

            return self.finalize(task, outcome).await;
        }
    }

    async fn run_attempt(
        &self,
        task: &K6Task,
        script: &str,
        port: AllocatedPort,
    ) -> AttemptOutcome {
        let run_id = task.run_id;

        let extraction_dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => {
                return AttemptOutcome::failed(format!("failed to create extraction dir: {err}"))
            }
        };

        let mut job = ContainerJob::new(
            self.config.image.clone(),
            vec![
                "k6".into(),
                "run".into(),
                "--summary-export".into(),
                K6_SUMMARY_PATH.into(),
                "--summary-trend-stats".into(),
                "avg,min,med,max,p(90),p(95),p(99)".into(),
                "--out".into(),
                "web-dashboard".into(),
                "--out".into(),
                format!("json={K6_METRICS_PATH}"),
                K6_SCRIPT_FILE.into(),
            ],
        );
        job.inline_script_content = Some(script.to_string());
        job.inline_script_file_name = Some(K6_SCRIPT_FILE.to_string());
        job.ensure_dirs = vec!["/tmp/report".to_string()];
        job.memory_mb = self.config.memory_mb;
        job.cpu_fraction = self.config.cpu_fraction;
        job.network = NetworkMode::Bridge;
        job.timeout_ms = task.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        job.run_id = Some(run_id);
        job.extract_from_container = Some("/tmp/.".to_string());
        job.extract_to_host = Some(extraction_dir.path().to_path_buf());

        job.env.insert("K6_WEB_DASHBOARD".into(), "true".into());
        job.env
            .insert("K6_WEB_DASHBOARD_EXPORT".into(), K6_REPORT_EXPORT_PATH.into());
        job.env.insert(
            "K6_WEB_DASHBOARD_PORT".into(),
            port.port_number().to_string(),
        );
        job.env.insert(
            "K6_WEB_DASHBOARD_ADDR".into(),
            self.ports.bind_addr().to_string(),
        );
        job.env.insert("K6_NO_COLOR".into(), "1".into());
        if let AllocatedPort::Pooled(number) = port {
            job.publish_ports = vec![number];
        }

        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel::<OutputChunk>();
        let publisher = self.console_publisher.clone();
        let channel = Self::console_channel(&run_id);
        let forwarder = tokio::spawn(async move {
            while let Some(chunk) = receiver.recv().await {
                if chunk.stream == OutputStream::Stdout {
                    if let Some(publisher) = &publisher {
                        let text = String::from_utf8_lossy(&chunk.bytes);
                        if let Err(err) = publisher.publish(&channel, &text).await {
                            warn!(error = %err, "Console chunk publish failed");
                        }
                    }
                }
            }
        });

        let result = self.executor.execute_in_container(&job, Some(sender)).await;
        let _ = forwarder.await;

        match result {
            Ok(result) => AttemptOutcome {
                exit_code: result.exit_code,
                timed_out: result.timed_out,
                cancelled: result.cancelled,
                duration_ms: result.duration_ms,
                console_output: Some(result.stdout),
                stderr: Some(result.stderr),
                error: result.error,
                extraction_dir: Some(extraction_dir),
            },
            Err(validation) => AttemptOutcome::failed(validation.to_string()),
        }
    }

    async fn finalize(&self, task: &K6Task, attempt: AttemptOutcome) -> K6RunOutcome {
        let run_id = task.run_id;

        let summary = match &attempt.extraction_dir {
            Some(dir) => Self::read_summary(dir.path()).await,
            None => None,
        };

        let verdict = compute_verdict(attempt.timed_out, attempt.exit_code, summary.as_ref());
        let headline = summary.as_ref().map(extract_headline_metrics);

        let mut report_url = None;
        let mut summary_url = None;
        let mut console_url = None;

        if let Some(dir) = &attempt.extraction_dir {
            let uploaded = self
                .upload_artifacts(&run_id, dir.path(), attempt.console_output.as_deref())
                .await;
            report_url = uploaded.report_url;
            summary_url = uploaded.summary_url;
            console_url = uploaded.console_url;
        }

        info!(
            %run_id,
            passed = verdict.passed,
            thresholds_passed = verdict.thresholds_passed,
            timed_out = attempt.timed_out,
            "k6 run finished"
        );

        K6RunOutcome {
            run_id: Some(run_id),
            success: verdict.passed,
            timed_out: attempt.timed_out,
            cancelled: attempt.cancelled,
            duration_ms: attempt.duration_ms,
            thresholds_passed: verdict.thresholds_passed,
            summary,
            headline,
            report_url,
            summary_url,
            console_url,
            console_output: attempt.console_output,
            error: attempt.error,
        }
    }

    async fn read_summary(extraction_dir: &Path) -> Option<K6Summary> {
        let path = extraction_dir.join("summary.json");
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match K6Summary::parse(&raw) {
                Ok(summary) => Some(summary),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Unparseable k6 summary");
                    None
                }
            },
            Err(_) => None,
        }
    }

    async fn upload_artifacts(
        &self,
        run_id: &RunId,
        extraction_dir: &Path,
        console_output: Option<&str>,
    ) -> UploadedArtifacts {
        let mut uploaded = UploadedArtifacts::default();

        // The dashboard exports report.html; it is published as index.html.
        let report = extraction_dir.join("report").join("report.html");
        if report.exists() {
            let key = format!("{run_id}/index.html");
            if self.storage.put_file(&key, &report).await.is_ok() {
                uploaded.report_url = Some(self.storage.public_url(&key));
            }
        }

        let summary = extraction_dir.join("summary.json");
        if summary.exists() {
            let key = format!("{run_id}/summary.json");
            if self.storage.put_file(&key, &summary).await.is_ok() {
                uploaded.summary_url = Some(self.storage.public_url(&key));
            }
        }

        if let Some(console) = console_output {
            let key = format!("{run_id}/console.log");
            if self
                .storage
                .put_bytes(&key, console.as_bytes().to_vec(), "text/plain")
                .await
                .is_ok()
            {
                uploaded.console_url = Some(self.storage.public_url(&key));
            }
        }

        let metrics = extraction_dir.join("metrics.json");
        if metrics.exists() {
            let key = format!("{run_id}/metrics.json");
            let _ = self.storage.put_file(&key, &metrics).await;
        }

        uploaded
    }

    fn stderr_indicates_port_clash(stderr: Option<&str>) -> bool {
        stderr
            .map(|stderr| {
                stderr.contains("address already in use") || stderr.contains("EADDRINUSE")
            })
            .unwrap_or(false)
    }

    fn failed_before_launch(run_id: RunId, error: String) -> K6RunOutcome {
        K6RunOutcome {
            run_id: Some(run_id),
            error: Some(error),
            ..Default::default()
        }
    }
}

struct AttemptOutcome {
    exit_code: Option<i32>,
    timed_out: bool,
    cancelled: bool,
    duration_ms: u64,
    console_output: Option<String>,
    stderr: Option<String>,
    error: Option<String>,
    extraction_dir: Option<tempfile::TempDir>,
}

impl AttemptOutcome {
    fn failed(error: String) -> Self {
        Self {
            exit_code: None,
            timed_out: false,
            cancelled: false,
            duration_ms: 0,
            console_output: None,
            stderr: None,
            error: Some(error),
            extraction_dir: None,
        }
    }
}

#[derive(Default)]
struct UploadedArtifacts {
    report_url: Option<String>,
    summary_url: Option<String>,
    console_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn console_channel_matches_the_contract() {
        let run_id = RunId::new_v4();
        assert_eq!(
            K6Runner::console_channel(&run_id),
            format!("k6:run:{run_id}:console")
        );
    }

    #[test]
    fn port_clash_detection() {
        assert!(K6Runner::stderr_indicates_port_clash(Some(
            "msg=\"error listening on :5665: address already in use\""
        )));
        assert!(K6Runner::stderr_indicates_port_clash(Some(
            "Error: listen EADDRINUSE: address already in use"
        )));
        assert!(!K6Runner::stderr_indicates_port_clash(Some("boom")));
        assert!(!K6Runner::stderr_indicates_port_clash(None));
    }
}
