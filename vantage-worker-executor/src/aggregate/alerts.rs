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

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};
use vantage_common::model::{MonitorId, MonitorResultRecord, MonitorSpec, MonitorStatus};
use vantage_common::redis::RedisPool;
use vantage_service_base::clients::notification::{Notification, NotificationService};
use vantage_service_base::repo::monitor_result::MonitorResultRepo;

/// Hard cap on alerts per failure run and per recovery run.
pub const MAX_ALERTS_PER_RUN: u32 = 3;

pub const SSL_ALERT_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// First alert once the consecutive counter has reached the threshold (at
/// the first tick where sending is possible); repeats every
/// `max(5, threshold * 2)` runs after that; never more than
/// [`MAX_ALERTS_PER_RUN`].
pub fn alert_due(consecutive_count: u32, threshold: u32, alerts_sent: u32) -> bool {
    let threshold = threshold.max(1);
    if alerts_sent >= MAX_ALERTS_PER_RUN || consecutive_count < threshold {
        return false;
    }
    if alerts_sent == 0 {
        return true;
    }
    let interval = (threshold * 2).max(5);
    consecutive_count > threshold && (consecutive_count - threshold) % interval == 0
}

/// Cross-process debounce for the SSL-expiration path: at most one alert
/// per monitor per window.
#[async_trait]
pub trait AlertDebounce: Send + Sync {
    /// True when the caller won the window and may alert.
    async fn try_acquire(&self, monitor_id: &MonitorId, window: Duration) -> bool;
}

pub struct RedisAlertDebounce {
    pool: RedisPool,
}

impl RedisAlertDebounce {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlertDebounce for RedisAlertDebounce {
    async fn try_acquire(&self, monitor_id: &MonitorId, window: Duration) -> bool {
        match self
            .pool
            .set_nx_px(&format!("ssl-alert:{monitor_id}"), "1", window)
            .await
        {
            Ok(acquired) => acquired,
            Err(err) => {
                // Better to stay silent than to spam on a flaky store.
                warn!(%monitor_id, error = %err, "SSL alert debounce unavailable");
                false
            }
        }
    }
}

#[derive(Default)]
pub struct InMemoryAlertDebounce {
    windows: Mutex<HashMap<MonitorId, std::time::Instant>>,
}

impl InMemoryAlertDebounce {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlertDebounce for InMemoryAlertDebounce {
    async fn try_acquire(&self, monitor_id: &MonitorId, window: Duration) -> bool {
        let mut windows = self.windows.lock().unwrap();
        let now = std::time::Instant::now();
        match windows.get(monitor_id) {
            Some(last) if now.duration_since(*last) < window => false,
            _ => {
                windows.insert(*monitor_id, now);
                true
            }
        }
    }
}

/// Decides whether an aggregated verdict produces user-visible alerts.
pub struct AlertGate {
    notifications: Arc<dyn NotificationService>,
    results: Arc<dyn MonitorResultRepo>,
    ssl_debounce: Arc<dyn AlertDebounce>,
}

impl AlertGate {
    pub fn new(
        notifications: Arc<dyn NotificationService>,
        results: Arc<dyn MonitorResultRepo>,
        ssl_debounce: Arc<dyn AlertDebounce>,
    ) -> Self {
        Self {
            notifications,
            results,
            ssl_debounce,
        }
    }

    pub async fn on_aggregated_result(
        &self,
        monitor: &MonitorSpec,
        previous_status: MonitorStatus,
        aggregate_up: bool,
        location: vantage_common::model::LocationCode,
        latest_record: &MonitorResultRecord,
    ) {
        if !monitor.alerts.enabled {
            return;
        }

        self.evaluate_ssl_expiration(monitor, latest_record).await;

        // There is no meaningful up/down transition out of a monitor that
        // was never live or was paused by its owner. The SSL path above is
        // independent of transitions and already ran.
        if previous_status.is_boot_or_pause() {
            info!(monitor = %monitor.id, %previous_status, "Up/down alerts suppressed for boot/pause tick");
            return;
        }

        let streak_started_with_flip = latest_record
            .details
            .get("streakStartedWithStatusChange")
            .and_then(|flag| flag.as_bool())
            .unwrap_or(false);

        if !aggregate_up
            && monitor.alerts.alert_on_failure
            && alert_due(
                latest_record.consecutive_failure_count,
                monitor.alerts.failure_threshold,
                latest_record.alerts_sent_for_failure,
            )
        {
            let details = latest_record
                .details
                .get("errorMessage")
                .and_then(|message| message.as_str())
                .unwrap_or("monitor is down")
                .to_string();
            if self
                .send(Notification::MonitorFailure {
                    monitor_id: monitor.id,
                    monitor_name: monitor.name.clone(),
                    details,
                })
                .await
            {
                let _ = self
                    .results
                    .increment_failure_alerts(&monitor.id, location)
                    .await;
            }
        }

        // Recovery alerts only make sense for a streak that actually began
        // with a down-to-up flip; a monitor that has been healthy forever
        // has nothing to recover from.
        if aggregate_up
            && monitor.alerts.alert_on_recovery
            && streak_started_with_flip
            && alert_due(
                latest_record.consecutive_success_count,
                monitor.alerts.recovery_threshold,
                latest_record.alerts_sent_for_recovery,
            )
        {
            if self
                .send(Notification::MonitorRecovery {
                    monitor_id: monitor.id,
                    monitor_name: monitor.name.clone(),
                    details: format!(
                        "monitor recovered after {} consecutive successful checks",
                        latest_record.consecutive_success_count
                    ),
                })
                .await
            {
                let _ = self
                    .results
                    .increment_recovery_alerts(&monitor.id, location)
                    .await;
            }
        }
    }

    /// SSL expiration alerting is independent of up/down transitions: at
    /// most one notice per monitor per 24 h while the certificate stays
    /// inside the warning window (or expired).
    async fn evaluate_ssl_expiration(
        &self,
        monitor: &MonitorSpec,
        latest_record: &MonitorResultRecord,
    ) {
        if !monitor.alerts.alert_on_ssl_expiration {
            return;
        }
        let Some(days_remaining) = latest_record
            .details
            .get("sslCertificate")
            .and_then(|certificate| certificate.get("daysRemaining"))
            .and_then(|days| days.as_i64())
        else {
            return;
        };
        if days_remaining > monitor.ssl_warning_threshold_days {
            return;
        }
        if !self
            .ssl_debounce
            .try_acquire(&monitor.id, SSL_ALERT_WINDOW)
            .await
        {
            return;
        }

        let message = if days_remaining < 0 {
            format!("certificate expired {} days ago", -days_remaining)
        } else {
            format!("certificate expires in {days_remaining} days")
        };
        self.send(Notification::SslExpiration {
            monitor_id: monitor.id,
            monitor_name: monitor.name.clone(),
            days_remaining,
            message,
        })
        .await;
    }

    async fn send(&self, notification: Notification) -> bool {
        match self.notifications.notify(notification).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "Alert delivery failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn first_alert_fires_once_the_threshold_is_reached() {
        assert!(!alert_due(0, 1, 0));
        assert!(alert_due(1, 1, 0));
        assert!(!alert_due(2, 3, 0));
        assert!(alert_due(3, 3, 0));
        // A failed or suppressed send is caught up on the next tick.
        assert!(alert_due(5, 3, 0));
        // Threshold crossed but the first alert was already sent.
        assert!(!alert_due(3, 3, 1));
    }

    #[test]
    fn subsequent_alerts_follow_the_interval() {
        // threshold 1: interval max(5, 2) = 5 -> counts 1, 6, 11.
        assert!(alert_due(1, 1, 0));
        assert!(!alert_due(2, 1, 1));
        assert!(alert_due(6, 1, 1));
        assert!(alert_due(11, 1, 2));

        // threshold 4: interval 8 -> counts 4, 12, 20.
        assert!(alert_due(4, 4, 0));
        assert!(!alert_due(8, 4, 1));
        assert!(alert_due(12, 4, 1));
        assert!(alert_due(20, 4, 2));
    }

    #[test]
    fn never_more_than_three_alerts_per_run() {
        assert!(!alert_due(16, 1, 3));
        assert!(!alert_due(100, 1, 3));
        for count in 0..200 {
            assert!(
                !alert_due(count, 5, MAX_ALERTS_PER_RUN),
                "count {count} must not alert past the cap"
            );
        }
    }

    #[test]
    fn off_interval_ticks_stay_silent_after_the_first_alert() {
        assert!(!alert_due(3, 1, 1));
        assert!(!alert_due(7, 1, 1));
        assert!(!alert_due(13, 4, 1));
    }

    #[test]
    async fn ssl_debounce_is_one_per_window() {
        let debounce = InMemoryAlertDebounce::new();
        let monitor_id = MonitorId::new_v4();
        assert!(debounce.try_acquire(&monitor_id, SSL_ALERT_WINDOW).await);
        assert!(!debounce.try_acquire(&monitor_id, SSL_ALERT_WINDOW).await);

        let other = MonitorId::new_v4();
        assert!(debounce.try_acquire(&other, SSL_ALERT_WINDOW).await);
    }
}
