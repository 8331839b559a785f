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

use super::{FailOutcome, JobQueue, LeasedJob, QueueName};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConsumerConfig {
    pub concurrency: usize,
    #[serde(with = "humantime_serde")]
    pub lock_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub stall_interval: Duration,
    pub max_stalled_count: u32,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for QueueConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            lock_duration: Duration::from_secs(300),
            stall_interval: Duration::from_secs(30),
            max_stalled_count: 2,
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl QueueConsumerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    fn heartbeat_interval(&self) -> Duration {
        self.lock_duration / 3
    }
}

/// Outcome of handling one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDisposition {
    Complete,
    /// Failed; eligible for the queue's retry/backoff policy.
    Retry(String),
    /// Failed terminally; never re-queued (cancellations, validation).
    Discard(String),
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, queue: QueueName, job: &LeasedJob) -> JobDisposition;
}

/// Pulls jobs from one queue and runs them on a bounded set of in-process
/// tasks. Holds the lease lock alive with a heartbeat while a handler runs
/// and recovers stalled siblings on a timer.
pub struct QueueConsumer {
    queue: QueueName,
    job_queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: QueueConsumerConfig,
}

impl QueueConsumer {
    pub fn new(
        queue: QueueName,
        job_queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        config: QueueConsumerConfig,
    ) -> Self {
        Self {
            queue,
            job_queue,
            handler,
            config,
        }
    }

    pub fn start(self, join_set: &mut JoinSet<anyhow::Result<()>>, shutdown: CancellationToken) {
        let queue = self.queue;
        let stall_queue = self.job_queue.clone();
        let stall_config = self.config.clone();
        let stall_shutdown = shutdown.clone();

        join_set.spawn(
            async move {
                let mut ticker = tokio::time::interval(stall_config.stall_interval);
                loop {
                    tokio::select! {
                        _ = stall_shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(err) = stall_queue
                                .recover_stalled(queue, stall_config.max_stalled_count)
                                .await
                            {
                                warn!(%queue, error = %err, "Stalled-job recovery failed");
                            }
                        }
                    }
                }
                Ok(())
            }
            .in_current_span(),
        );

        join_set.spawn(
            async move {
                self.run(shutdown).await;
                Ok(())
            }
            .in_current_span(),
        );
    }

    async fn run(self, shutdown: CancellationToken) {
        info!(queue = %self.queue, concurrency = self.config.concurrency, "Queue consumer started");
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut workers: JoinSet<()> = JoinSet::new();

        loop {
            // Finished handlers are reaped opportunistically so the join set
            // does not grow without bound.
            while workers.try_join_next().is_some() {}

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let claimed = tokio::select! {
                _ = shutdown.cancelled() => {
                    drop(permit);
                    break;
                }
                claimed = self.job_queue.dequeue(self.queue, self.config.lock_duration) => claimed,
            };

            match claimed {
                Ok(Some(job)) => {
                    let queue = self.queue;
                    let job_queue = self.job_queue.clone();
                    let handler = self.handler.clone();
                    let heartbeat_interval = self.config.heartbeat_interval();
                    let lock_duration = self.config.lock_duration;

                    workers.spawn(
                        async move {
                            let _permit = permit;
                            Self::process_one(
                                queue,
                                job_queue,
                                handler,
                                job,
                                heartbeat_interval,
                                lock_duration,
                            )
                            .await;
                        }
                        .in_current_span(),
                    );
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(err) => {
                    drop(permit);
                    error!(queue = %self.queue, error = %err, "Dequeue failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        // Drain in-flight handlers before reporting the consumer stopped.
        while workers.join_next().await.is_some() {}
        info!(queue = %self.queue, "Queue consumer stopped");
    }

    async fn process_one(
        queue: QueueName,
        job_queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        job: LeasedJob,
        heartbeat_interval: Duration,
        lock_duration: Duration,
    ) {
        let heartbeat_queue = job_queue.clone();
        let heartbeat_job = job.clone();
        let heartbeat_stop = CancellationToken::new();
        let heartbeat_guard = heartbeat_stop.clone();
        let heartbeat = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(heartbeat_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = heartbeat_guard.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(err) = heartbeat_queue
                                .extend_lock(queue, &heartbeat_job, lock_duration)
                                .await
                            {
                                warn!(%queue, job_id = %heartbeat_job.job_id, error = %err, "Lock extension failed");
                            }
                        }
                    }
                }
            }
            .in_current_span(),
        );

        let disposition = handler.handle(queue, &job).await;
        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        let resolution = match disposition {
            JobDisposition::Complete => job_queue.complete(queue, &job).await.map(|_| None),
            JobDisposition::Retry(error) => job_queue
                .fail(queue, &job, &error, true)
                .await
                .map(Some),
            JobDisposition::Discard(error) => job_queue
                .fail(queue, &job, &error, false)
                .await
                .map(Some),
        };

        match resolution {
            Ok(Some(FailOutcome::Retried { delay })) => {
                info!(%queue, job_id = %job.job_id, ?delay, "Job will be retried");
            }
            Ok(_) => {}
            Err(err) => {
                error!(%queue, job_id = %job.job_id, error = %err, "Failed to resolve job lease");
            }
        }
    }
}
