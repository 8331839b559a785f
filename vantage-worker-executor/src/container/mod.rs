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

pub mod executor;
pub mod script;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;
use vantage_common::model::RunId;
use vantage_common::SafeDisplay;

pub const MIN_MEMORY_MB: u64 = 128;
pub const MAX_MEMORY_MB: u64 = 8192;
pub const MIN_CPU_FRACTION: f64 = 0.1;
pub const MAX_CPU_FRACTION: f64 = 4.0;
pub const MIN_TIMEOUT_MS: u64 = 5_000;
pub const MAX_TIMEOUT_MS: u64 = 3_600_000;

pub const EXIT_CODE_TIMEOUT: i32 = 124;
pub const EXIT_CODE_CANCELLED: i32 = 137;

lazy_static! {
    static ref ENV_NAME: Regex = Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    None,
    Bridge,
    Host,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::None => "none",
            NetworkMode::Bridge => "bridge",
            NetworkMode::Host => "host",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdditionalFile {
    /// Plain-text file body; the launch wrapper writes it base64-encoded.
    pub content: String,
    /// Absolute target path inside the container.
    pub target_path: String,
}

/// One containerized execution. Build once, run once; a job is never reused
/// across runs.
#[derive(Debug, Clone)]
pub struct ContainerJob {
    pub image: String,
    pub cmd: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub memory_mb: u64,
    pub cpu_fraction: f64,
    pub network: NetworkMode,
    pub timeout_ms: u64,
    /// Plain-text script body injected into the container at launch.
    pub inline_script_content: Option<String>,
    /// File name the command refers to; rewritten to `/tmp/{name}`.
    pub inline_script_file_name: Option<String>,
    pub additional_files: Vec<AdditionalFile>,
    pub ensure_dirs: Vec<String>,
    pub extract_from_container: Option<String>,
    pub extract_to_host: Option<PathBuf>,
    pub run_id: Option<RunId>,
    /// Host ports to publish 1:1 (dashboards).
    pub publish_ports: Vec<u16>,
}

impl ContainerJob {
    pub fn new(image: impl Into<String>, cmd: Vec<String>) -> Self {
        Self {
            image: image.into(),
            cmd,
            env: HashMap::new(),
            working_dir: None,
            memory_mb: MIN_MEMORY_MB,
            cpu_fraction: MIN_CPU_FRACTION,
            network: NetworkMode::None,
            timeout_ms: MIN_TIMEOUT_MS,
            inline_script_content: None,
            inline_script_file_name: None,
            additional_files: Vec::new(),
            ensure_dirs: Vec::new(),
            extract_from_container: None,
            extract_to_host: None,
            run_id: None,
            publish_ports: Vec::new(),
        }
    }

    /// Checks every launch precondition. Validation failures surface before
    /// any container is created and are never retried.
    pub fn validate(&self) -> Result<(), ContainerValidationError> {
        if self.inline_script_content.is_none() || self.inline_script_file_name.is_none() {
            // The legacy host-path script mode was removed; inline content
            // is the only supported injection.
            return Err(ContainerValidationError::MissingInlineScript);
        }
        if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&self.memory_mb) {
            return Err(ContainerValidationError::MemoryOutOfRange(self.memory_mb));
        }
        if !(MIN_CPU_FRACTION..=MAX_CPU_FRACTION).contains(&self.cpu_fraction) {
            return Err(ContainerValidationError::CpuOutOfRange(self.cpu_fraction));
        }
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&self.timeout_ms) {
            return Err(ContainerValidationError::TimeoutOutOfRange(self.timeout_ms));
        }
        if self.extract_from_container.is_some() && self.extract_to_host.is_none() {
            return Err(ContainerValidationError::ExtractionTargetMissing);
        }
        Ok(())
    }

    /// Environment variables with invalid names dropped (warned, not fatal).
    pub fn sanitized_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .env
            .iter()
            .filter(|(name, _)| {
                let valid = ENV_NAME.is_match(name);
                if !valid {
                    warn!(name, "Dropping environment variable with invalid name");
                }
                valid
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        env.sort_by(|a, b| a.0.cmp(&b.0));
        env
    }

    /// `--rm` is only safe when nothing has to be copied out afterwards.
    pub fn remove_on_exit(&self) -> bool {
        self.extract_from_container.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContainerValidationError {
    #[error("inline script content and file name are required")]
    MissingInlineScript,
    #[error("memory limit {0} MB outside [{MIN_MEMORY_MB}, {MAX_MEMORY_MB}]")]
    MemoryOutOfRange(u64),
    #[error("cpu fraction {0} outside [{MIN_CPU_FRACTION}, {MAX_CPU_FRACTION}]")]
    CpuOutOfRange(f64),
    #[error("timeout {0} ms outside [{MIN_TIMEOUT_MS}, {MAX_TIMEOUT_MS}]")]
    TimeoutOutOfRange(u64),
    #[error("extract_to_host is required when extract_from_container is set")]
    ExtractionTargetMissing,
}

impl SafeDisplay for ContainerValidationError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub bytes: bytes::Bytes,
}

/// Result of one containerized execution. `timed_out` distinguishes the
/// outer timer from in-container failures; cancellations surface as exit
/// code 137 with `error = "cancelled"`.
#[derive(Debug, Clone)]
pub struct ContainerExecutionResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub cancelled: bool,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    fn valid_job() -> ContainerJob {
        let mut job = ContainerJob::new("vantage/worker:latest", vec!["node".into(), "test.js".into()]);
        job.inline_script_content = Some("console.log('hi')".into());
        job.inline_script_file_name = Some("test.js".into());
        job.memory_mb = 1536;
        job.cpu_fraction = 1.0;
        job.timeout_ms = 60_000;
        job
    }

    #[test]
    fn in_range_limits_validate_unchanged() {
        let job = valid_job();
        assert_eq!(job.validate(), Ok(()));
        assert_eq!(job.memory_mb, 1536);
        assert_eq!(job.cpu_fraction, 1.0);
        assert_eq!(job.timeout_ms, 60_000);
    }

    #[test]
    fn out_of_range_limits_are_rejected() {
        let mut job = valid_job();
        job.memory_mb = 64;
        assert_eq!(
            job.validate(),
            Err(ContainerValidationError::MemoryOutOfRange(64))
        );

        let mut job = valid_job();
        job.cpu_fraction = 8.0;
        assert!(matches!(
            job.validate(),
            Err(ContainerValidationError::CpuOutOfRange(_))
        ));

        let mut job = valid_job();
        job.timeout_ms = 1_000;
        assert_eq!(
            job.validate(),
            Err(ContainerValidationError::TimeoutOutOfRange(1_000))
        );

        let mut job = valid_job();
        job.timeout_ms = 4_000_000;
        assert!(job.validate().is_err());
    }

    #[test]
    fn inline_script_is_mandatory() {
        let mut job = valid_job();
        job.inline_script_content = None;
        assert_eq!(
            job.validate(),
            Err(ContainerValidationError::MissingInlineScript)
        );
    }

    #[test]
    fn extraction_requires_host_target() {
        let mut job = valid_job();
        job.extract_from_container = Some("/tmp/.".into());
        assert_eq!(
            job.validate(),
            Err(ContainerValidationError::ExtractionTargetMissing)
        );
        job.extract_to_host = Some(PathBuf::from("/var/tmp/out"));
        assert_eq!(job.validate(), Ok(()));
        assert!(!job.remove_on_exit());
    }

    #[test]
    fn invalid_env_names_are_dropped() {
        let mut job = valid_job();
        job.env.insert("VALID_NAME".into(), "1".into());
        job.env.insert("_ALSO_VALID".into(), "2".into());
        job.env.insert("1BAD".into(), "3".into());
        job.env.insert("BAD-DASH".into(), "4".into());
        job.env.insert("BAD NAME".into(), "5".into());

        let env = job.sanitized_env();
        let names: Vec<&str> = env.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["_ALSO_VALID", "VALID_NAME"]);
    }
}
