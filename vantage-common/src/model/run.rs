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
use crate::model::secret::Secret;
use crate::newtype_uuid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

newtype_uuid!(RunId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Playwright,
    K6,
}

impl Display for JobType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Playwright => write!(f, "playwright"),
            JobType::K6 => write!(f, "k6"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Error,
    Blocked,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Passed | RunStatus::Failed | RunStatus::Error | RunStatus::Blocked
        )
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
            RunStatus::Error => "error",
            RunStatus::Blocked => "blocked",
        };
        write!(f, "{s}")
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "passed" => Ok(RunStatus::Passed),
            "failed" => Ok(RunStatus::Failed),
            "error" => Ok(RunStatus::Error),
            "blocked" => Ok(RunStatus::Blocked),
            _ => Err(format!("Invalid run status: {s}")),
        }
    }
}

/// One test script carried by a job trigger. `kind` distinguishes browser
/// tests from performance tests; k6 jobs require exactly one `performance`
/// entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestScript {
    pub id: uuid::Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Base64-encoded script body, resolved by the scheduler.
    pub script: String,
}

pub const TEST_KIND_PERFORMANCE: &str = "performance";

/// A fired trigger as handed to the dispatcher. Variables and secrets arrive
/// pre-resolved; the execution fabric never reads credential storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTrigger {
    pub job_id: uuid::Uuid,
    pub run_id: RunId,
    pub job_type: JobType,
    pub organization_id: uuid::Uuid,
    pub project_id: uuid::Uuid,
    pub test_scripts: Vec<TestScript>,
    #[serde(default)]
    pub resolved_variables: HashMap<String, String>,
    #[serde(default)]
    pub resolved_secrets: HashMap<String, Secret>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
}

fn default_retry_limit() -> u32 {
    3
}

/// Execution record of a single run. Created by the dispatcher before the
/// job is enqueued; from then on mutated only by the worker that owns the
/// execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<uuid::Uuid>,
    pub location: LocationCode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl RunRecord {
    pub fn new_running(run_id: RunId, job_id: Option<uuid::Uuid>, location: LocationCode) -> Self {
        Self {
            run_id,
            job_id,
            location,
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            report_url: None,
            logs_url: None,
            error_details: None,
            metadata: serde_json::Value::Null,
        }
    }
}

pub const CANCELLED_BY_USER: &str = "cancelled by user";
