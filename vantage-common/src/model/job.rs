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

//! Queue message bodies. One struct per queue family; the wire shape (field
//! names, nesting) is a compatibility contract shared with the producers and
//! autoscalers and must not drift.

use crate::model::location::LocationCode;
use crate::model::monitor::{MonitorId, MonitorKind, MonitorSpec};
use crate::model::result::ExecutionGroupId;
use crate::model::run::{JobType, RunId, TestScript};
use crate::model::secret::Secret;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Body of a `monitor-{region}` message: one location's share of a monitor
/// tick, carrying everything the aggregator needs to find its siblings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorJob {
    pub monitor_id: MonitorId,
    #[serde(rename = "type")]
    pub kind: MonitorKind,
    pub target: String,
    pub config: MonitorSpec,
    /// May be a concrete location code or the wildcard `*`/`any`.
    pub execution_location: String,
    pub execution_group_id: ExecutionGroupId,
    pub expected_locations: Vec<LocationCode>,
    pub retry_limit: u32,
}

impl MonitorJob {
    /// Queue dedup key: one message per (monitor, group, location).
    pub fn dedup_id(&self) -> String {
        format!(
            "{}:{}:{}",
            self.monitor_id, self.execution_group_id, self.execution_location
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Schedule,
    Manual,
}

/// Body of a `playwright-global` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaywrightJob {
    pub run_id: RunId,
    pub job_id: uuid::Uuid,
    pub test_scripts: Vec<TestScript>,
    pub trigger: TriggerKind,
    pub organization_id: uuid::Uuid,
    pub project_id: uuid::Uuid,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub secrets: HashMap<String, Secret>,
    pub job_type: JobType,
}

/// Body of a `k6-global` / `k6-{region}` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K6Job {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<uuid::Uuid>,
    pub test_id: uuid::Uuid,
    /// Base64-encoded k6 script body.
    pub script: String,
    #[serde(default)]
    pub tests: Vec<K6TestRef>,
    pub organization_id: uuid::Uuid,
    pub project_id: uuid::Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub job_type: JobType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K6TestRef {
    pub id: uuid::Uuid,
    pub script: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::monitor::MonitorStatus;
    use test_r::test;

    #[test]
    fn monitor_job_wire_format_is_camel_case() {
        let spec: MonitorSpec = serde_json::from_value(serde_json::json!({
            "id": "9f0c64a2-9e8b-4ab7-b35b-fb98bd23847e",
            "name": "homepage",
            "target": "https://example.com",
            "kind": "http",
            "status": "up"
        }))
        .unwrap();
        assert_eq!(spec.status, MonitorStatus::Up);

        let job = MonitorJob {
            monitor_id: spec.id,
            kind: spec.kind,
            target: spec.target.clone(),
            config: spec,
            execution_location: "us-east".to_string(),
            execution_group_id: ExecutionGroupId::from_string("m-1-abc"),
            expected_locations: vec![LocationCode::UsEast, LocationCode::EuCentral],
            retry_limit: 2,
        };

        let value = serde_json::to_value(&job).unwrap();
        assert!(value.get("monitorId").is_some());
        assert!(value.get("type").is_some());
        assert!(value.get("executionLocation").is_some());
        assert!(value.get("executionGroupId").is_some());
        assert!(value.get("expectedLocations").is_some());

        let back: MonitorJob = serde_json::from_value(value).unwrap();
        assert_eq!(back.dedup_id(), job.dedup_id());
    }
}
