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

use super::{
    EnqueueOutcome, FailOutcome, JobOptions, JobQueue, LeasedJob, QueueError, QueueName,
    RetentionPolicy,
};
use crate::redis::RedisPool;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Redis-backed queue. Per queue `q` the layout is:
///
/// - `queue:{q}:wait` - list of job ids ready to run
/// - `queue:{q}:delayed` - zset of job ids scored by ready-at epoch ms
/// - `queue:{q}:active` - list of claimed job ids
/// - `queue:{q}:lock:{id}` - lease lock (NX + PX), value is the lease token
/// - `queue:{q}:completed` / `queue:{q}:failed` - zsets scored by finish time
/// - `queue:{q}:job:{id}` - serialized job record; its existence is the
///   dedup condition for producers
pub struct RedisJobQueue {
    pool: RedisPool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredJob {
    id: String,
    payload: serde_json::Value,
    options: JobOptions,
    attempts_made: u32,
    stalls: u32,
    enqueued_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

impl RedisJobQueue {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    fn wait_key(queue: QueueName) -> String {
        format!("queue:{queue}:wait")
    }

    fn delayed_key(queue: QueueName) -> String {
        format!("queue:{queue}:delayed")
    }

    fn active_key(queue: QueueName) -> String {
        format!("queue:{queue}:active")
    }

    fn lock_key(queue: QueueName, job_id: &str) -> String {
        format!("queue:{queue}:lock:{job_id}")
    }

    fn job_key(queue: QueueName, job_id: &str) -> String {
        format!("queue:{queue}:job:{job_id}")
    }

    fn completed_key(queue: QueueName) -> String {
        format!("queue:{queue}:completed")
    }

    fn failed_key(queue: QueueName) -> String {
        format!("queue:{queue}:failed")
    }

    async fn read_job(
        &self,
        queue: QueueName,
        job_id: &str,
    ) -> Result<Option<StoredJob>, QueueError> {
        let raw = self.pool.get(&Self::job_key(queue, job_id)).await?;
        match raw {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|err| QueueError::MalformedJob(format!("{job_id}: {err}"))),
        }
    }

    async fn write_job(&self, queue: QueueName, job: &StoredJob) -> Result<(), QueueError> {
        let raw =
            serde_json::to_string(job).map_err(|err| QueueError::Serialization(err.to_string()))?;
        // Retention trimming removes finished jobs; the long TTL is only a
        // safety net against records orphaned by lost queues.
        self.pool
            .set_ex(
                &Self::job_key(queue, &job.id),
                &raw,
                Duration::from_secs(30 * 86_400),
            )
            .await?;
        Ok(())
    }

    /// Moves every due delayed job to the wait list.
    async fn promote_delayed(&self, queue: QueueName) -> Result<(), QueueError> {
        let now_ms = Utc::now().timestamp_millis() as f64;
        let due = self
            .pool
            .zrangebyscore(&Self::delayed_key(queue), f64::NEG_INFINITY, now_ms, Some(100))
            .await?;
        for job_id in due {
            self.pool.zrem(&Self::delayed_key(queue), &job_id).await?;
            self.pool.lpush(&Self::wait_key(queue), &job_id).await?;
        }
        Ok(())
    }

    async fn remove_active(&self, queue: QueueName, job: &LeasedJob) -> Result<(), QueueError> {
        self.pool
            .lrem(&Self::active_key(queue), 0, &job.job_id)
            .await?;
        self.pool
            .del(&Self::lock_key(queue, &job.job_id))
            .await?;
        Ok(())
    }

    /// Applies a retention policy to a finished-jobs zset, deleting the
    /// trimmed jobs' records.
    async fn trim(
        &self,
        queue: QueueName,
        set_key: &str,
        policy: &RetentionPolicy,
    ) -> Result<(), QueueError> {
        let oldest_allowed_ms = (Utc::now()
            - chrono::Duration::from_std(policy.age).unwrap_or_else(|_| chrono::Duration::zero()))
        .timestamp_millis() as f64;
        let expired = self
            .pool
            .zrangebyscore(set_key, f64::NEG_INFINITY, oldest_allowed_ms, None)
            .await?;
        for job_id in &expired {
            self.pool.del(&Self::job_key(queue, job_id)).await?;
        }
        self.pool
            .zremrangebyscore(set_key, f64::NEG_INFINITY, oldest_allowed_ms)
            .await?;

        let size = self.pool.zcard(set_key).await?;
        let excess = size - policy.count as i64;
        if excess > 0 {
            let overflow = self
                .pool
                .zrangebyscore(set_key, f64::NEG_INFINITY, f64::INFINITY, Some(excess))
                .await?;
            for job_id in &overflow {
                self.pool.del(&Self::job_key(queue, job_id)).await?;
            }
            self.pool.zremrangebyrank(set_key, 0, excess - 1).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        job_id: &str,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        if self.pool.exists(&Self::job_key(queue, job_id)).await? {
            debug!(%queue, job_id, "Duplicate job dropped");
            return Ok(EnqueueOutcome::Deduplicated);
        }

        let job = StoredJob {
            id: job_id.to_string(),
            payload,
            options: options.clone(),
            attempts_made: 0,
            stalls: 0,
            enqueued_at_ms: Utc::now().timestamp_millis(),
            last_error: None,
        };
        self.write_job(queue, &job).await?;

        if options.delay > Duration::ZERO {
            let ready_at = (Utc::now().timestamp_millis()
                + options.delay.as_millis() as i64) as f64;
            self.pool
                .zadd(&Self::delayed_key(queue), ready_at, job_id)
                .await?;
        } else if options.priority > 0 {
            // The consumer pops from the tail; pushing there makes the job
            // jump ahead of plain FIFO traffic.
            self.pool.rpush(&Self::wait_key(queue), job_id).await?;
        } else {
            self.pool.lpush(&Self::wait_key(queue), job_id).await?;
        }

        debug!(%queue, job_id, "Job enqueued");
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn dequeue(
        &self,
        queue: QueueName,
        lock_duration: Duration,
    ) -> Result<Option<LeasedJob>, QueueError> {
        self.promote_delayed(queue).await?;

        let claimed = self
            .pool
            .rpoplpush(&Self::wait_key(queue), &Self::active_key(queue))
            .await?;
        let Some(job_id) = claimed else {
            return Ok(None);
        };

        let Some(mut job) = self.read_job(queue, &job_id).await? else {
            // Record vanished (trimmed or corrupted); drop the orphan id.
            warn!(%queue, job_id, "Claimed job has no record, dropping");
            self.pool
                .lrem(&Self::active_key(queue), 0, &job_id)
                .await?;
            return Ok(None);
        };

        job.attempts_made += 1;
        self.write_job(queue, &job).await?;

        let lease_token = uuid::Uuid::new_v4().to_string();
        self.pool
            .set_nx_px(
                &Self::lock_key(queue, &job_id),
                &lease_token,
                lock_duration,
            )
            .await?;

        Ok(Some(LeasedJob {
            job_id,
            payload: job.payload,
            attempts_made: job.attempts_made,
            max_attempts: job.options.attempts,
            lease_token,
        }))
    }

    async fn extend_lock(
        &self,
        queue: QueueName,
        job: &LeasedJob,
        lock_duration: Duration,
    ) -> Result<(), QueueError> {
        // Check-then-set is not atomic; the lock duration is generous
        // relative to the heartbeat interval, so a lost race only shortens
        // the lease.
        let current = self.pool.get(&Self::lock_key(queue, &job.job_id)).await?;
        if current.as_deref() == Some(job.lease_token.as_str()) {
            self.pool
                .set_ex(
                    &Self::lock_key(queue, &job.job_id),
                    &job.lease_token,
                    lock_duration,
                )
                .await?;
        }
        Ok(())
    }

    async fn complete(&self, queue: QueueName, job: &LeasedJob) -> Result<(), QueueError> {
        self.remove_active(queue, job).await?;
        let now_ms = Utc::now().timestamp_millis() as f64;
        self.pool
            .zadd(&Self::completed_key(queue), now_ms, &job.job_id)
            .await?;
        if let Some(stored) = self.read_job(queue, &job.job_id).await? {
            self.trim(
                queue,
                &Self::completed_key(queue),
                &stored.options.remove_on_complete,
            )
            .await?;
        }
        Ok(())
    }

    async fn fail(
        &self,
        queue: QueueName,
        job: &LeasedJob,
        error: &str,
        allow_retry: bool,
    ) -> Result<FailOutcome, QueueError> {
        self.remove_active(queue, job).await?;

        let Some(mut stored) = self.read_job(queue, &job.job_id).await? else {
            return Ok(FailOutcome::Terminal);
        };
        stored.last_error = Some(error.to_string());

        if allow_retry && stored.attempts_made < stored.options.attempts {
            let delay = stored.options.backoff_delay(stored.attempts_made);
            let ready_at =
                (Utc::now().timestamp_millis() + delay.as_millis() as i64) as f64;
            self.write_job(queue, &stored).await?;
            self.pool
                .zadd(&Self::delayed_key(queue), ready_at, &job.job_id)
                .await?;
            debug!(%queue, job_id = %job.job_id, ?delay, "Job scheduled for retry");
            Ok(FailOutcome::Retried { delay })
        } else {
            self.write_job(queue, &stored).await?;
            let now_ms = Utc::now().timestamp_millis() as f64;
            self.pool
                .zadd(&Self::failed_key(queue), now_ms, &job.job_id)
                .await?;
            self.trim(
                queue,
                &Self::failed_key(queue),
                &stored.options.remove_on_fail,
            )
            .await?;
            debug!(%queue, job_id = %job.job_id, error, "Job failed terminally");
            Ok(FailOutcome::Terminal)
        }
    }

    async fn recover_stalled(
        &self,
        queue: QueueName,
        max_stalled_count: u32,
    ) -> Result<u64, QueueError> {
        let active = self
            .pool
            .lrange(&Self::active_key(queue), 0, -1)
            .await?;
        let mut recovered = 0;

        for job_id in active {
            if self
                .pool
                .exists(&Self::lock_key(queue, &job_id))
                .await?
            {
                continue;
            }

            let Some(mut stored) = self.read_job(queue, &job_id).await? else {
                self.pool.lrem(&Self::active_key(queue), 0, &job_id).await?;
                continue;
            };

            stored.stalls += 1;
            self.pool.lrem(&Self::active_key(queue), 0, &job_id).await?;

            if stored.stalls > max_stalled_count {
                warn!(%queue, job_id, stalls = stored.stalls, "Job exceeded stall limit, failing");
                stored.last_error = Some("job stalled more than allowable limit".to_string());
                self.write_job(queue, &stored).await?;
                let now_ms = Utc::now().timestamp_millis() as f64;
                self.pool
                    .zadd(&Self::failed_key(queue), now_ms, &job_id)
                    .await?;
            } else {
                warn!(%queue, job_id, stalls = stored.stalls, "Stalled job re-queued");
                // The interrupted attempt does not count against the limit.
                stored.attempts_made = stored.attempts_made.saturating_sub(1);
                self.write_job(queue, &stored).await?;
                self.pool.lpush(&Self::wait_key(queue), &job_id).await?;
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    async fn depth(&self, queue: QueueName) -> Result<u64, QueueError> {
        let waiting = self.pool.llen(&Self::wait_key(queue)).await?;
        let delayed = self.pool.zcard(&Self::delayed_key(queue)).await?;
        Ok((waiting + delayed).max(0) as u64)
    }
}
