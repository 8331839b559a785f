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
use std::fmt::Display;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;
use vantage_common::config::RetryConfig;
use vantage_common::model::{MonitorId, RunId};
use vantage_common::retries::with_retries;
use vantage_common::SafeDisplay;

/// One alert or operational notice handed to the notification fan-out
/// (email/Slack/webhook routing happens on the other side).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Notification {
    #[serde(rename_all = "camelCase")]
    MonitorFailure {
        monitor_id: MonitorId,
        monitor_name: String,
        details: String,
    },
    #[serde(rename_all = "camelCase")]
    MonitorRecovery {
        monitor_id: MonitorId,
        monitor_name: String,
        details: String,
    },
    #[serde(rename_all = "camelCase")]
    SslExpiration {
        monitor_id: MonitorId,
        monitor_name: String,
        days_remaining: i64,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    RunBlocked {
        run_id: RunId,
        reason: String,
    },
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotificationError>;
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

impl NotificationError {
    fn is_retriable(_error: &NotificationError) -> bool {
        true
    }
}

impl SafeDisplay for NotificationError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

pub struct HttpNotificationService {
    client: reqwest::Client,
    endpoint: url::Url,
    access_token: uuid::Uuid,
    retry_config: RetryConfig,
}

impl HttpNotificationService {
    pub fn new(config: &RemoteServiceConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("Failed to build HTTP client"),
            endpoint: config.url(),
            access_token: config.access_token,
            retry_config: config.retries.clone(),
        }
    }
}

#[async_trait]
impl NotificationService for HttpNotificationService {
    async fn notify(&self, notification: Notification) -> Result<(), NotificationError> {
        with_retries(
            "notification",
            "notify",
            None,
            &self.retry_config,
            &(
                self.client.clone(),
                self.endpoint.clone(),
                self.access_token,
                notification,
            ),
            |(client, endpoint, token, notification)| {
                Box::pin(async move {
                    let response = client
                        .post(endpoint.join("v1/notifications").map_err(|err| {
                            NotificationError::Delivery(err.to_string())
                        })?)
                        .bearer_auth(token)
                        .json(notification)
                        .send()
                        .await
                        .map_err(|err| NotificationError::Delivery(err.to_string()))?;

                    if response.status().is_success() {
                        Ok(())
                    } else {
                        Err(NotificationError::Delivery(format!(
                            "notification endpoint returned {}",
                            response.status()
                        )))
                    }
                })
            },
            NotificationError::is_retriable,
        )
        .await
    }
}

/// Used when no notification endpoint is configured; alerts surface in the
/// worker's own logs only.
pub struct LoggingNotificationService;

#[async_trait]
impl NotificationService for LoggingNotificationService {
    async fn notify(&self, notification: Notification) -> Result<(), NotificationError> {
        info!(?notification, "Notification (logging sink)");
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryNotificationService {
    sent: Mutex<Vec<Notification>>,
}

impl InMemoryNotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationService for InMemoryNotificationService {
    async fn notify(&self, notification: Notification) -> Result<(), NotificationError> {
        self.sent.lock().unwrap().push(notification);
        Ok(())
    }
}

impl Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notification::MonitorFailure { monitor_name, .. } => {
                write!(f, "monitor failure: {monitor_name}")
            }
            Notification::MonitorRecovery { monitor_name, .. } => {
                write!(f, "monitor recovery: {monitor_name}")
            }
            Notification::SslExpiration {
                monitor_name,
                days_remaining,
                ..
            } => write!(
                f,
                "SSL expiration: {monitor_name} ({days_remaining} days remaining)"
            ),
            Notification::RunBlocked { run_id, .. } => write!(f, "run blocked: {run_id}"),
        }
    }
}
