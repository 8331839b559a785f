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

use super::script::build_wrapper_script;
use super::{
    ContainerExecutionResult, ContainerJob, ContainerValidationError, OutputChunk, OutputStream,
    EXIT_CODE_CANCELLED, EXIT_CODE_TIMEOUT,
};
use crate::services::active_runs::ActiveRunRegistry;
use crate::services::cancellation::CancellationStore;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vantage_common::SafeDisplay;

/// Stored per stream; overflowing output is dropped from the in-memory copy
/// while the sinks keep receiving every chunk.
const MAX_CAPTURED_OUTPUT: usize = 1024 * 1024;

const DOCKER_UNAVAILABLE: &str = "docker unavailable";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRuntimeConfig {
    pub docker_binary: String,
    /// uid:gid the workload runs as; never root.
    pub user: String,
    /// Seccomp profile allowing user-namespace syscalls so in-container
    /// browsers can build their own sandboxes.
    pub seccomp_profile_path: Option<String>,
    #[serde(with = "humantime_serde")]
    pub removal_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub cancellation_poll_interval: Duration,
}

impl Default for ContainerRuntimeConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            user: "1000:1000".to_string(),
            seccomp_profile_path: None,
            removal_timeout: Duration::from_secs(10),
            cancellation_poll_interval: Duration::from_secs(1),
        }
    }
}

impl SafeDisplay for ContainerRuntimeConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "docker binary: {}, user: {}, seccomp profile: {}",
            self.docker_binary,
            self.user,
            self.seccomp_profile_path.as_deref().unwrap_or("(default)")
        )
    }
}

/// Runs one command in a locked-down container: inline script injection,
/// live output streaming, outer timeout, external cancellation, optional
/// artifact extraction.
pub struct ContainerExecutor {
    config: ContainerRuntimeConfig,
    cancellation: Arc<dyn CancellationStore>,
    active_runs: Arc<ActiveRunRegistry>,
}

impl ContainerExecutor {
    pub fn new(
        config: ContainerRuntimeConfig,
        cancellation: Arc<dyn CancellationStore>,
        active_runs: Arc<ActiveRunRegistry>,
    ) -> Self {
        Self {
            config,
            cancellation,
            active_runs,
        }
    }

    pub async fn execute_in_container(
        &self,
        job: &ContainerJob,
        output: Option<UnboundedSender<OutputChunk>>,
    ) -> Result<ContainerExecutionResult, ContainerValidationError> {
        job.validate()?;

        let container_name = format!("exec-{}", Uuid::new_v4());
        let wrapper = build_wrapper_script(job);
        let args = self.docker_run_args(job, &container_name, &wrapper);

        debug!(container = %container_name, image = %job.image, "Launching container");
        let started = Instant::now();

        let mut child = match Command::new(&self.config.docker_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                error!(error = %err, "Container engine not available");
                return Ok(Self::engine_unavailable_result(started));
            }
        };

        if let Some(run_id) = &job.run_id {
            self.active_runs.attach_container(run_id, &container_name);
        }

        let stdout_task = Self::drain_stream(
            child.stdout.take(),
            OutputStream::Stdout,
            output.clone(),
        );
        let stderr_task = Self::drain_stream(child.stderr.take(), OutputStream::Stderr, output);

        let wait_outcome = self.supervise(&mut child, job).await;

        // After a timeout or cancellation the pipes only close once the
        // container is gone; kill before collecting the captured output.
        match wait_outcome {
            WaitOutcome::TimedOut => {
                warn!(container = %container_name, timeout_ms = job.timeout_ms, "Container timed out");
                self.kill_container(&container_name).await;
                Self::reap(&mut child).await;
            }
            WaitOutcome::Cancelled => {
                info!(container = %container_name, "Container cancelled externally");
                self.kill_container(&container_name).await;
                Self::reap(&mut child).await;
                if let Some(run_id) = &job.run_id {
                    self.cancellation.clear_cancellation(run_id).await;
                }
            }
            WaitOutcome::Exited(_) => {}
        }

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match wait_outcome {
            WaitOutcome::Exited(code) => {
                let error = if code == Some(0) {
                    None
                } else if Self::looks_like_engine_failure(&stderr) {
                    Some(DOCKER_UNAVAILABLE.to_string())
                } else {
                    Some(format!(
                        "container exited with code {}",
                        code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".into())
                    ))
                };
                ContainerExecutionResult {
                    success: code == Some(0),
                    exit_code: code,
                    stdout,
                    stderr,
                    duration_ms,
                    // The in-container command may itself surface the outer
                    // timeout convention.
                    timed_out: code == Some(EXIT_CODE_TIMEOUT),
                    cancelled: false,
                    error,
                }
            }
            WaitOutcome::TimedOut => ContainerExecutionResult {
                success: false,
                exit_code: Some(EXIT_CODE_TIMEOUT),
                stdout,
                stderr,
                duration_ms,
                timed_out: true,
                cancelled: false,
                error: Some(format!("timed out after {} ms", job.timeout_ms)),
            },
            WaitOutcome::Cancelled => ContainerExecutionResult {
                success: false,
                exit_code: Some(EXIT_CODE_CANCELLED),
                stdout,
                stderr,
                duration_ms,
                timed_out: false,
                cancelled: true,
                error: Some("cancelled".to_string()),
            },
        };

        // Extraction only on a run that actually finished on its own; its
        // failure never overrides the primary result.
        if !result.timed_out && !result.cancelled {
            if let (Some(from), Some(to)) = (&job.extract_from_container, &job.extract_to_host) {
                if let Err(err) = self
                    .extract_artifacts(&container_name, from, to.as_path())
                    .await
                {
                    warn!(container = %container_name, error = %err, "Artifact extraction failed");
                }
            }
        }

        if !job.remove_on_exit() && !result.timed_out && !result.cancelled {
            self.remove_container(&container_name).await;
        }

        if let Some(run_id) = &job.run_id {
            self.active_runs.detach_container(run_id);
        }

        Ok(result)
    }

    fn docker_run_args(
        &self,
        job: &ContainerJob,
        container_name: &str,
        wrapper: &str,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--name".into(),
            container_name.to_string(),
            "--user".into(),
            self.config.user.clone(),
            "--init".into(),
            "--ipc=host".into(),
            "--security-opt=no-new-privileges".into(),
            "--cap-drop=ALL".into(),
        ];

        if let Some(profile) = &self.config.seccomp_profile_path {
            args.push("--security-opt".into());
            args.push(format!("seccomp={profile}"));
        }

        // Swap equals memory: the workload gets RAM, never swap.
        args.push("--memory".into());
        args.push(format!("{}m", job.memory_mb));
        args.push("--memory-swap".into());
        args.push(format!("{}m", job.memory_mb));
        args.push("--cpus".into());
        args.push(format!("{}", job.cpu_fraction));
        args.push("--pids-limit=256".into());
        args.push("--shm-size=512m".into());
        args.push("--network".into());
        args.push(job.network.as_str().into());

        for port in &job.publish_ports {
            args.push("-p".into());
            args.push(format!("{port}:{port}"));
        }

        for (name, value) in job.sanitized_env() {
            args.push("--env".into());
            args.push(format!("{name}={value}"));
        }

        if let Some(dir) = &job.working_dir {
            args.push("--workdir".into());
            args.push(dir.clone());
        }

        if job.remove_on_exit() {
            args.push("--rm".into());
        }

        args.push("--entrypoint".into());
        args.push("/bin/sh".into());
        args.push(job.image.clone());
        args.push("-c".into());
        args.push(wrapper.to_string());

        args
    }

    async fn supervise(&self, child: &mut Child, job: &ContainerJob) -> WaitOutcome {
        let timeout = tokio::time::sleep(Duration::from_millis(job.timeout_ms));
        tokio::pin!(timeout);

        let mut poll = tokio::time::interval(self.config.cancellation_poll_interval);
        poll.tick().await;

        loop {
            tokio::select! {
                status = child.wait() => {
                    return match status {
                        Ok(status) => WaitOutcome::Exited(status.code()),
                        Err(_) => WaitOutcome::Exited(None),
                    };
                }
                _ = &mut timeout => {
                    return WaitOutcome::TimedOut;
                }
                _ = poll.tick(), if job.run_id.is_some() => {
                    let run_id = job.run_id.as_ref().unwrap();
                    if self.cancellation.is_cancelled(run_id).await {
                        return WaitOutcome::Cancelled;
                    }
                }
            }
        }
    }

    fn drain_stream(
        stream: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
        kind: OutputStream,
        sink: Option<UnboundedSender<OutputChunk>>,
    ) -> tokio::task::JoinHandle<String> {
        tokio::spawn(async move {
            let Some(mut stream) = stream else {
                return String::new();
            };
            let mut captured: Vec<u8> = Vec::new();
            let mut buffer = [0u8; 8192];
            loop {
                match stream.read(&mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if captured.len() < MAX_CAPTURED_OUTPUT {
                            let remaining = MAX_CAPTURED_OUTPUT - captured.len();
                            captured.extend_from_slice(&buffer[..n.min(remaining)]);
                        }
                        if let Some(sink) = &sink {
                            let _ = sink.send(OutputChunk {
                                stream: kind,
                                bytes: bytes::Bytes::copy_from_slice(&buffer[..n]),
                            });
                        }
                    }
                }
            }
            String::from_utf8_lossy(&captured).into_owned()
        })
    }

    async fn reap(child: &mut Child) {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }

    /// Signal, then force-remove. Both steps are best-effort; a vanished
    /// container is already what we want.
    pub async fn kill_container(&self, container_name: &str) {
        self.run_docker(&["kill", container_name], Duration::from_secs(5))
            .await;
        self.remove_container(container_name).await;
    }

    async fn remove_container(&self, container_name: &str) {
        self.run_docker(&["rm", "-f", container_name], self.config.removal_timeout)
            .await;
    }

    async fn extract_artifacts(
        &self,
        container_name: &str,
        from: &str,
        to: &std::path::Path,
    ) -> Result<(), String> {
        tokio::fs::create_dir_all(to)
            .await
            .map_err(|err| err.to_string())?;

        // Directory-contents semantics: `docker cp c:/tmp/. host` copies the
        // directory's contents, not the directory itself.
        let source = if from.ends_with("/.") {
            format!("{container_name}:{from}")
        } else {
            format!("{container_name}:{}/.", from.trim_end_matches('/'))
        };
        let target = to.to_string_lossy().to_string();

        let output = tokio::time::timeout(
            self.config.removal_timeout,
            Command::new(&self.config.docker_binary)
                .args(["cp", &source, &target])
                .output(),
        )
        .await
        .map_err(|_| "docker cp timed out".to_string())?
        .map_err(|err| err.to_string())?;

        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).into_owned())
        }
    }

    async fn run_docker(&self, args: &[&str], timeout: Duration) {
        let result = tokio::time::timeout(
            timeout,
            Command::new(&self.config.docker_binary).args(args).output(),
        )
        .await;
        match result {
            Ok(Ok(output)) if !output.status.success() => {
                debug!(
                    ?args,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "docker command reported failure"
                );
            }
            Ok(Err(err)) => warn!(?args, error = %err, "docker command failed to start"),
            Err(_) => warn!(?args, "docker command timed out"),
            _ => {}
        }
    }

    fn engine_unavailable_result(started: Instant) -> ContainerExecutionResult {
        ContainerExecutionResult {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: started.elapsed().as_millis() as u64,
            timed_out: false,
            cancelled: false,
            error: Some(DOCKER_UNAVAILABLE.to_string()),
        }
    }

    fn looks_like_engine_failure(stderr: &str) -> bool {
        stderr.contains("Cannot connect to the Docker daemon")
            || stderr.contains("Unable to find image")
            || stderr.contains("pull access denied")
            || stderr.contains("no such host")
    }
}

#[derive(Clone, Copy)]
enum WaitOutcome {
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::active_runs::ActiveRunRegistry;
    use crate::services::cancellation::InMemoryCancellationStore;
    use test_r::test;

    fn executor() -> ContainerExecutor {
        ContainerExecutor::new(
            ContainerRuntimeConfig {
                seccomp_profile_path: Some("/etc/vantage/seccomp.json".to_string()),
                ..Default::default()
            },
            Arc::new(InMemoryCancellationStore::new()),
            Arc::new(ActiveRunRegistry::new()),
        )
    }

    fn valid_job() -> ContainerJob {
        let mut job = ContainerJob::new("vantage/worker:latest", vec!["node".into(), "t.js".into()]);
        job.inline_script_content = Some("x".into());
        job.inline_script_file_name = Some("t.js".into());
        job.memory_mb = 1536;
        job.cpu_fraction = 1.0;
        job.timeout_ms = 60_000;
        job
    }

    #[test]
    fn run_args_carry_the_isolation_contract() {
        let executor = executor();
        let mut job = valid_job();
        job.network = crate::container::NetworkMode::Bridge;
        job.env.insert("K6_NO_COLOR".into(), "1".into());
        let args = executor.docker_run_args(&job, "exec-test", "set -e");

        for expected in [
            "--user",
            "--init",
            "--ipc=host",
            "--security-opt=no-new-privileges",
            "--cap-drop=ALL",
            "--memory",
            "--memory-swap",
            "--cpus",
            "--pids-limit=256",
            "--shm-size=512m",
            "--network",
            "--entrypoint",
            "--rm",
        ] {
            assert!(args.contains(&expected.to_string()), "missing {expected}");
        }
        assert!(args.contains(&"seccomp=/etc/vantage/seccomp.json".to_string()));
        assert!(args.contains(&"1536m".to_string()));
        assert!(args.contains(&"bridge".to_string()));
        assert!(args.contains(&"K6_NO_COLOR=1".to_string()));

        // Memory and memory-swap are equal: no swap for workloads.
        let memory_values: Vec<_> = args.iter().filter(|a| *a == "1536m").collect();
        assert_eq!(memory_values.len(), 2);
    }

    #[test]
    fn extraction_disables_rm(){
        let executor = executor();
        let mut job = valid_job();
        job.extract_from_container = Some("/tmp/.".into());
        job.extract_to_host = Some(std::path::PathBuf::from("/var/tmp/out"));
        let args = executor.docker_run_args(&job, "exec-test", "set -e");
        assert!(!args.contains(&"--rm".to_string()));
    }

    #[test]
    async fn validation_rejects_before_any_launch() {
        let executor = executor();
        let mut job = valid_job();
        job.memory_mb = 16;
        let result = executor.execute_in_container(&job, None).await;
        assert!(matches!(
            result,
            Err(ContainerValidationError::MemoryOutOfRange(16))
        ));
    }

    #[test]
    fn engine_failure_patterns() {
        assert!(ContainerExecutor::looks_like_engine_failure(
            "docker: Cannot connect to the Docker daemon at unix:///var/run/docker.sock"
        ));
        assert!(ContainerExecutor::looks_like_engine_failure(
            "Unable to find image 'missing:latest' locally"
        ));
        assert!(!ContainerExecutor::looks_like_engine_failure(
            "some script error"
        ));
    }
}
