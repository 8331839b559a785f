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

//! Job queue layer shared by the scheduler (producer side) and the regional
//! workers (consumer side). Queue names are a fixed wire contract; producers,
//! workers and autoscalers all resolve them from [`QueueName`] and nothing
//! else.

pub mod consumer;
pub mod memory;
pub mod redis;

use crate::model::LocationCode;
use crate::redis::RedisError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    MonitorRegion(LocationCode),
    PlaywrightGlobal,
    K6Global,
    K6Region(LocationCode),
    JobScheduler,
    K6JobScheduler,
    MonitorScheduler,
}

impl QueueName {
    /// The physical queue name. These strings are shared with external
    /// producers and autoscalers verbatim; no environment override exists.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::MonitorRegion(LocationCode::UsEast) => "monitor-us-east",
            QueueName::MonitorRegion(LocationCode::EuCentral) => "monitor-eu-central",
            QueueName::MonitorRegion(LocationCode::AsiaPacific) => "monitor-asia-pacific",
            QueueName::PlaywrightGlobal => "playwright-global",
            QueueName::K6Global => "k6-global",
            QueueName::K6Region(LocationCode::UsEast) => "k6-us-east",
            QueueName::K6Region(LocationCode::EuCentral) => "k6-eu-central",
            QueueName::K6Region(LocationCode::AsiaPacific) => "k6-asia-pacific",
            QueueName::JobScheduler => "job-scheduler",
            QueueName::K6JobScheduler => "k6-job-scheduler",
            QueueName::MonitorScheduler => "monitor-scheduler",
        }
    }

    pub fn all_monitor_regions() -> Vec<QueueName> {
        LocationCode::all()
            .into_iter()
            .map(QueueName::MonitorRegion)
            .collect()
    }

    pub fn all_k6_regions() -> Vec<QueueName> {
        LocationCode::all()
            .into_iter()
            .map(QueueName::K6Region)
            .collect()
    }
}

impl Display for QueueName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub count: usize,
    #[serde(with = "humantime_serde")]
    pub age: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub attempts: u32,
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    pub priority: u8,
    pub remove_on_complete: RetentionPolicy,
    pub remove_on_fail: RetentionPolicy,
    #[serde(with = "humantime_serde")]
    pub lock_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl JobOptions {
    /// Defaults for monitor probe jobs.
    pub fn monitor() -> Self {
        Self {
            attempts: 2,
            backoff_base: Duration::from_secs(2),
            priority: 0,
            remove_on_complete: RetentionPolicy {
                count: 500,
                age: Duration::from_secs(86_400),
            },
            remove_on_fail: RetentionPolicy {
                count: 1000,
                age: Duration::from_secs(7 * 86_400),
            },
            lock_duration: Duration::from_secs(300),
            delay: Duration::ZERO,
        }
    }

    /// Defaults for Playwright/k6 execution jobs.
    pub fn execution() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_secs(5),
            ..Self::monitor()
        }
    }

    /// Defaults for scheduler bookkeeping jobs.
    pub fn scheduler() -> Self {
        Self {
            lock_duration: Duration::from_secs(120),
            ..Self::monitor()
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Exponential backoff delay before attempt `attempts_made + 1`.
    pub fn backoff_delay(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(16);
        self.backoff_base * 2u32.pow(exponent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A live job with the same id already exists; the message was dropped.
    Deduplicated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-queued with backoff; the job will run again.
    Retried { delay: Duration },
    /// All attempts exhausted (or retry forbidden); the job is failed.
    Terminal,
}

/// A job claimed by a consumer, protected by a lease lock until completed,
/// failed or stalled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeasedJob {
    pub job_id: String,
    pub payload: serde_json::Value,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub lease_token: String,
}

impl LeasedJob {
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|err| QueueError::MalformedJob(format!("{}: {err}", self.job_id)))
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Malformed job: {0}")]
    MalformedJob(String),
}

/// Producer/consumer contract implemented by the Redis queue and by the
/// in-memory queue used in tests.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        queue: QueueName,
        job_id: &str,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> Result<EnqueueOutcome, QueueError>;

    /// Claims the next ready job, if any. The returned lease must be
    /// resolved with [`complete`](Self::complete) or [`fail`](Self::fail),
    /// or it will eventually be recovered as stalled.
    async fn dequeue(
        &self,
        queue: QueueName,
        lock_duration: Duration,
    ) -> Result<Option<LeasedJob>, QueueError>;

    async fn extend_lock(
        &self,
        queue: QueueName,
        job: &LeasedJob,
        lock_duration: Duration,
    ) -> Result<(), QueueError>;

    async fn complete(&self, queue: QueueName, job: &LeasedJob) -> Result<(), QueueError>;

    async fn fail(
        &self,
        queue: QueueName,
        job: &LeasedJob,
        error: &str,
        allow_retry: bool,
    ) -> Result<FailOutcome, QueueError>;

    /// Moves stalled active jobs (lease expired without resolution) back to
    /// the wait list, failing jobs that stalled too often. Returns the
    /// number of jobs recovered.
    async fn recover_stalled(
        &self,
        queue: QueueName,
        max_stalled_count: u32,
    ) -> Result<u64, QueueError>;

    /// Waiting + delayed jobs, for back-pressure metrics.
    async fn depth(&self, queue: QueueName) -> Result<u64, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn queue_names_match_the_wire_contract() {
        assert_eq!(
            QueueName::MonitorRegion(LocationCode::UsEast).as_str(),
            "monitor-us-east"
        );
        assert_eq!(
            QueueName::MonitorRegion(LocationCode::EuCentral).as_str(),
            "monitor-eu-central"
        );
        assert_eq!(
            QueueName::MonitorRegion(LocationCode::AsiaPacific).as_str(),
            "monitor-asia-pacific"
        );
        assert_eq!(QueueName::PlaywrightGlobal.as_str(), "playwright-global");
        assert_eq!(QueueName::K6Global.as_str(), "k6-global");
        assert_eq!(
            QueueName::K6Region(LocationCode::UsEast).as_str(),
            "k6-us-east"
        );
        assert_eq!(QueueName::JobScheduler.as_str(), "job-scheduler");
        assert_eq!(QueueName::K6JobScheduler.as_str(), "k6-job-scheduler");
        assert_eq!(QueueName::MonitorScheduler.as_str(), "monitor-scheduler");
    }

    #[test]
    fn backoff_is_exponential_from_the_base() {
        let options = JobOptions::execution();
        assert_eq!(options.backoff_delay(1), Duration::from_secs(5));
        assert_eq!(options.backoff_delay(2), Duration::from_secs(10));
        assert_eq!(options.backoff_delay(3), Duration::from_secs(20));
    }

    #[test]
    fn option_defaults_follow_the_contract() {
        let monitor = JobOptions::monitor();
        assert_eq!(monitor.attempts, 2);
        assert_eq!(monitor.backoff_base, Duration::from_secs(2));
        assert_eq!(monitor.lock_duration, Duration::from_secs(300));
        assert_eq!(monitor.remove_on_complete.count, 500);
        assert_eq!(monitor.remove_on_fail.count, 1000);

        let execution = JobOptions::execution();
        assert_eq!(execution.attempts, 3);
        assert_eq!(execution.backoff_base, Duration::from_secs(5));

        let scheduler = JobOptions::scheduler();
        assert_eq!(scheduler.lock_duration, Duration::from_secs(120));
    }
}
