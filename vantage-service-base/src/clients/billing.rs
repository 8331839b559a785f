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
use serde::Deserialize;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;
use vantage_common::SafeDisplay;

/// Pre-flight gate consulted before any billable execution starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingDecision {
    Allowed,
    Blocked { reason: String },
}

#[async_trait]
pub trait BillingService: Send + Sync {
    async fn check_execution_allowed(
        &self,
        organization_id: &Uuid,
    ) -> Result<BillingDecision, BillingError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Billing service unavailable: {0}")]
    Unavailable(String),
}

impl SafeDisplay for BillingError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

pub struct HttpBillingService {
    client: reqwest::Client,
    endpoint: url::Url,
    access_token: Uuid,
}

#[derive(Debug, Deserialize)]
struct BillingResponse {
    allowed: bool,
    #[serde(default)]
    reason: Option<String>,
}

impl HttpBillingService {
    pub fn new(config: &RemoteServiceConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("Failed to build HTTP client"),
            endpoint: config.url(),
            access_token: config.access_token,
        }
    }
}

#[async_trait]
impl BillingService for HttpBillingService {
    async fn check_execution_allowed(
        &self,
        organization_id: &Uuid,
    ) -> Result<BillingDecision, BillingError> {
        let url = self
            .endpoint
            .join(&format!("v1/organizations/{organization_id}/execution-allowance"))
            .map_err(|err| BillingError::Unavailable(err.to_string()))?;

        let response = self
            .client
            .get(url)
            .bearer_auth(self.access_token)
            .send()
            .await
            .map_err(|err| BillingError::Unavailable(err.to_string()))?;

        if !response.status().is_success() {
            return Err(BillingError::Unavailable(format!(
                "billing endpoint returned {}",
                response.status()
            )));
        }

        let body: BillingResponse = response
            .json()
            .await
            .map_err(|err| BillingError::Unavailable(err.to_string()))?;

        if body.allowed {
            Ok(BillingDecision::Allowed)
        } else {
            Ok(BillingDecision::Blocked {
                reason: body
                    .reason
                    .unwrap_or_else(|| "execution quota exceeded".to_string()),
            })
        }
    }
}

/// Default when no billing collaborator is deployed: everything runs.
pub struct PermissiveBillingService;

#[async_trait]
impl BillingService for PermissiveBillingService {
    async fn check_execution_allowed(
        &self,
        _organization_id: &Uuid,
    ) -> Result<BillingDecision, BillingError> {
        Ok(BillingDecision::Allowed)
    }
}

#[derive(Default)]
pub struct StaticBillingService {
    decision: Mutex<Option<BillingDecision>>,
}

impl StaticBillingService {
    pub fn allowing() -> Self {
        Self {
            decision: Mutex::new(Some(BillingDecision::Allowed)),
        }
    }

    pub fn blocking(reason: &str) -> Self {
        Self {
            decision: Mutex::new(Some(BillingDecision::Blocked {
                reason: reason.to_string(),
            })),
        }
    }

    pub fn set(&self, decision: BillingDecision) {
        *self.decision.lock().unwrap() = Some(decision);
    }
}

#[async_trait]
impl BillingService for StaticBillingService {
    async fn check_execution_allowed(
        &self,
        _organization_id: &Uuid,
    ) -> Result<BillingDecision, BillingError> {
        Ok(self
            .decision
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(BillingDecision::Allowed))
    }
}
