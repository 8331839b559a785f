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
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// In-process queue with the same semantics as the Redis implementation
/// (dedup, attempts, backoff, priority), used by tests and local tooling.
/// Delayed jobs become ready based on wall clock at dequeue time.
#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<HashMap<QueueName, QueueState>>,
}

#[derive(Default)]
struct QueueState {
    wait: VecDeque<String>,
    delayed: Vec<(i64, String)>,
    active: Vec<String>,
    jobs: HashMap<String, MemoryJob>,
    completed: Vec<String>,
    failed: Vec<String>,
}

#[derive(Clone)]
struct MemoryJob {
    payload: serde_json::Value,
    options: JobOptions,
    attempts_made: u32,
    last_error: Option<String>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed_ids(&self, queue: QueueName) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .get(&queue)
            .map(|q| q.completed.clone())
            .unwrap_or_default()
    }

    pub fn failed_ids(&self, queue: QueueName) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .get(&queue)
            .map(|q| q.failed.clone())
            .unwrap_or_default()
    }

    pub fn last_error(&self, queue: QueueName, job_id: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .get(&queue)
            .and_then(|q| q.jobs.get(job_id))
            .and_then(|job| job.last_error.clone())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        job_id: &str,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        let mut state = self.state.lock().unwrap();
        let queue_state = state.entry(queue).or_default();

        if queue_state.jobs.contains_key(job_id) {
            return Ok(EnqueueOutcome::Deduplicated);
        }

        queue_state.jobs.insert(
            job_id.to_string(),
            MemoryJob {
                payload,
                options: options.clone(),
                attempts_made: 0,
                last_error: None,
            },
        );

        if options.delay > Duration::ZERO {
            let ready_at = Utc::now().timestamp_millis() + options.delay.as_millis() as i64;
            queue_state.delayed.push((ready_at, job_id.to_string()));
        } else if options.priority > 0 {
            queue_state.wait.push_back(job_id.to_string());
        } else {
            queue_state.wait.push_front(job_id.to_string());
        }

        Ok(EnqueueOutcome::Enqueued)
    }

    async fn dequeue(
        &self,
        queue: QueueName,
        _lock_duration: Duration,
    ) -> Result<Option<LeasedJob>, QueueError> {
        let mut state = self.state.lock().unwrap();
        let queue_state = state.entry(queue).or_default();

        let now_ms = Utc::now().timestamp_millis();
        let mut still_delayed = Vec::new();
        for (ready_at, job_id) in queue_state.delayed.drain(..) {
            if ready_at <= now_ms {
                queue_state.wait.push_front(job_id);
            } else {
                still_delayed.push((ready_at, job_id));
            }
        }
        queue_state.delayed = still_delayed;

        let Some(job_id) = queue_state.wait.pop_back() else {
            return Ok(None);
        };
        queue_state.active.push(job_id.clone());

        let job = queue_state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| QueueError::MalformedJob(job_id.clone()))?;
        job.attempts_made += 1;

        Ok(Some(LeasedJob {
            job_id,
            payload: job.payload.clone(),
            attempts_made: job.attempts_made,
            max_attempts: job.options.attempts,
            lease_token: uuid::Uuid::new_v4().to_string(),
        }))
    }

    async fn extend_lock(
        &self,
        _queue: QueueName,
        _job: &LeasedJob,
        _lock_duration: Duration,
    ) -> Result<(), QueueError> {
        Ok(())
    }

    async fn complete(&self, queue: QueueName, job: &LeasedJob) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let queue_state = state.entry(queue).or_default();
        queue_state.active.retain(|id| id != &job.job_id);
        queue_state.completed.push(job.job_id.clone());
        Ok(())
    }

    async fn fail(
        &self,
        queue: QueueName,
        job: &LeasedJob,
        error: &str,
        allow_retry: bool,
    ) -> Result<FailOutcome, QueueError> {
        let mut state = self.state.lock().unwrap();
        let queue_state = state.entry(queue).or_default();
        queue_state.active.retain(|id| id != &job.job_id);

        let stored = queue_state
            .jobs
            .get_mut(&job.job_id)
            .ok_or_else(|| QueueError::MalformedJob(job.job_id.clone()))?;
        stored.last_error = Some(error.to_string());

        if allow_retry && stored.attempts_made < stored.options.attempts {
            let delay = stored.options.backoff_delay(stored.attempts_made);
            let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            queue_state.delayed.push((ready_at, job.job_id.clone()));
            Ok(FailOutcome::Retried { delay })
        } else {
            queue_state.failed.push(job.job_id.clone());
            Ok(FailOutcome::Terminal)
        }
    }

    async fn recover_stalled(
        &self,
        _queue: QueueName,
        _max_stalled_count: u32,
    ) -> Result<u64, QueueError> {
        Ok(0)
    }

    async fn depth(&self, queue: QueueName) -> Result<u64, QueueError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .get(&queue)
            .map(|q| (q.wait.len() + q.delayed.len()) as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LocationCode;
    use test_r::test;

    const QUEUE: QueueName = QueueName::MonitorRegion(LocationCode::UsEast);

    #[test]
    async fn enqueue_dedups_by_job_id() {
        let queue = InMemoryJobQueue::new();
        let options = JobOptions::monitor();
        let first = queue
            .enqueue(QUEUE, "job-1", serde_json::json!({"n": 1}), &options)
            .await
            .unwrap();
        let second = queue
            .enqueue(QUEUE, "job-1", serde_json::json!({"n": 2}), &options)
            .await
            .unwrap();
        assert_eq!(first, EnqueueOutcome::Enqueued);
        assert_eq!(second, EnqueueOutcome::Deduplicated);
    }

    #[test]
    async fn priority_jobs_jump_the_line() {
        let queue = InMemoryJobQueue::new();
        let plain = JobOptions::monitor();
        let urgent = JobOptions::monitor().with_priority(10);

        queue
            .enqueue(QUEUE, "slow", serde_json::json!({}), &plain)
            .await
            .unwrap();
        queue
            .enqueue(QUEUE, "urgent", serde_json::json!({}), &urgent)
            .await
            .unwrap();

        let first = queue
            .dequeue(QUEUE, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.job_id, "urgent");
    }

    #[test]
    async fn failure_retries_until_attempts_exhausted() {
        let queue = InMemoryJobQueue::new();
        let options = JobOptions::monitor().with_backoff_base(Duration::ZERO);
        queue
            .enqueue(QUEUE, "flaky", serde_json::json!({}), &options)
            .await
            .unwrap();

        let lease = queue
            .dequeue(QUEUE, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        let outcome = queue.fail(QUEUE, &lease, "boom", true).await.unwrap();
        assert!(matches!(outcome, FailOutcome::Retried { .. }));

        let lease = queue
            .dequeue(QUEUE, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.attempts_made, 2);
        let outcome = queue.fail(QUEUE, &lease, "boom again", true).await.unwrap();
        assert_eq!(outcome, FailOutcome::Terminal);
        assert_eq!(queue.failed_ids(QUEUE), vec!["flaky".to_string()]);
    }

    #[test]
    async fn cancelled_jobs_never_retry() {
        let queue = InMemoryJobQueue::new();
        let options = JobOptions::execution();
        queue
            .enqueue(QUEUE, "cancelled", serde_json::json!({}), &options)
            .await
            .unwrap();

        let lease = queue
            .dequeue(QUEUE, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        let outcome = queue
            .fail(QUEUE, &lease, "cancelled by user", false)
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Terminal);
    }
}
