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

use crate::config::RemoteServiceConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;
use vantage_common::model::{RunId, Secret};
use vantage_common::SafeDisplay;

/// Request to the external Playwright execution driver. Synthetic monitors
/// always set `bypass_concurrency_check` and `unique_execution_id`; their
/// probes must not queue behind user-triggered test runs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaywrightExecutionRequest {
    pub run_id: RunId,
    pub test_name: String,
    /// Decoded script body.
    pub script: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub secrets: HashMap<String, Secret>,
    pub bypass_concurrency_check: bool,
    pub unique_execution_id: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaywrightExecutionResult {
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub report_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PlaywrightClientError {
    #[error("Playwright driver unavailable: {0}")]
    Unavailable(String),
    #[error("Playwright driver rejected the request: {0}")]
    Rejected(String),
}

impl SafeDisplay for PlaywrightClientError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

#[async_trait]
pub trait PlaywrightClient: Send + Sync {
    async fn execute_test(
        &self,
        request: PlaywrightExecutionRequest,
    ) -> Result<PlaywrightExecutionResult, PlaywrightClientError>;

    /// Usage metering for synthetic executions, billed by wall time.
    async fn record_usage(
        &self,
        organization_id: &Uuid,
        duration_ms: u64,
    ) -> Result<(), PlaywrightClientError>;
}

pub struct HttpPlaywrightClient {
    client: reqwest::Client,
    endpoint: url::Url,
    access_token: Uuid,
}

impl HttpPlaywrightClient {
    pub fn new(config: &RemoteServiceConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                // Synthetic tests may legitimately run for minutes; the
                // driver enforces its own per-test timeout.
                .timeout(Duration::from_secs(600))
                .build()
                .expect("Failed to build HTTP client"),
            endpoint: config.url(),
            access_token: config.access_token,
        }
    }
}

#[async_trait]
impl PlaywrightClient for HttpPlaywrightClient {
    async fn execute_test(
        &self,
        request: PlaywrightExecutionRequest,
    ) -> Result<PlaywrightExecutionResult, PlaywrightClientError> {
        let url = self
            .endpoint
            .join("v1/executions")
            .map_err(|err| PlaywrightClientError::Unavailable(err.to_string()))?;

        let response = self
            .client
            .post(url)
            .bearer_auth(self.access_token)
            .json(&request)
            .send()
            .await
            .map_err(|err| PlaywrightClientError::Unavailable(err.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlaywrightClientError::Rejected(format!("{status}: {body}")));
        }
        if !status.is_success() {
            return Err(PlaywrightClientError::Unavailable(format!(
                "driver returned {status}"
            )));
        }

        response
            .json()
            .await
            .map_err(|err| PlaywrightClientError::Unavailable(err.to_string()))
    }

    async fn record_usage(
        &self,
        organization_id: &Uuid,
        duration_ms: u64,
    ) -> Result<(), PlaywrightClientError> {
        let url = self
            .endpoint
            .join(&format!("v1/organizations/{organization_id}/usage"))
            .map_err(|err| PlaywrightClientError::Unavailable(err.to_string()))?;

        self.client
            .post(url)
            .bearer_auth(self.access_token)
            .json(&serde_json::json!({ "durationMs": duration_ms }))
            .send()
            .await
            .map_err(|err| PlaywrightClientError::Unavailable(err.to_string()))?;
        Ok(())
    }
}

/// Scripted test double: returns queued canned results in order.
#[derive(Default)]
pub struct InMemoryPlaywrightClient {
    results: Mutex<Vec<Result<PlaywrightExecutionResult, PlaywrightClientError>>>,
    executed: Mutex<Vec<PlaywrightExecutionRequest>>,
    usage: Mutex<Vec<(Uuid, u64)>>,
}

impl InMemoryPlaywrightClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_result(&self, result: Result<PlaywrightExecutionResult, PlaywrightClientError>) {
        self.results.lock().unwrap().push(result);
    }

    pub fn executed(&self) -> Vec<PlaywrightExecutionRequest> {
        self.executed.lock().unwrap().clone()
    }

    pub fn recorded_usage(&self) -> Vec<(Uuid, u64)> {
        self.usage.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlaywrightClient for InMemoryPlaywrightClient {
    async fn execute_test(
        &self,
        request: PlaywrightExecutionRequest,
    ) -> Result<PlaywrightExecutionResult, PlaywrightClientError> {
        self.executed.lock().unwrap().push(request);
        let mut results = self.results.lock().unwrap();
        if results.is_empty() {
            Ok(PlaywrightExecutionResult {
                success: true,
                duration_ms: 100,
                report_url: None,
                error: None,
            })
        } else {
            results.remove(0)
        }
    }

    async fn record_usage(
        &self,
        organization_id: &Uuid,
        duration_ms: u64,
    ) -> Result<(), PlaywrightClientError> {
        self.usage
            .lock()
            .unwrap()
            .push((*organization_id, duration_ms));
        Ok(())
    }
}
