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

pub mod config;
pub mod dispatch;

use crate::config::SchedulerConfig;
use crate::dispatch::{JobDispatcher, MonitorDispatcher};
use anyhow::anyhow;
use async_trait::async_trait;
use poem::listener::{Acceptor, Listener, TcpListener};
use poem::{get, handler, Route};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};
use uuid::Uuid;
use vantage_common::config::DbConfig;
use vantage_common::model::{JobTrigger, MonitorSpec};
use vantage_common::queue::consumer::{
    JobDisposition, JobHandler, QueueConsumer, QueueConsumerConfig,
};
use vantage_common::queue::redis::RedisJobQueue;
use vantage_common::queue::{JobQueue, LeasedJob, QueueName};
use vantage_common::redis::RedisPool;
use vantage_common::SafeDisplay;
use vantage_service_base::db::{create_postgres_pool, create_sqlite_pool};
use vantage_service_base::repo::monitor::{DbMonitorRepo, MonitorRepo};
use vantage_service_base::repo::run::{DbRunRepo, RunRepo};

#[cfg(test)]
test_r::enable!();

/// Body of a `monitor-scheduler` message: a fired monitor tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorTick {
    pub monitor_id: Uuid,
}

struct MonitorTickHandler {
    monitors: Arc<dyn MonitorRepo>,
    dispatcher: MonitorDispatcher,
    retry_limit: u32,
}

#[async_trait]
impl JobHandler for MonitorTickHandler {
    async fn handle(&self, _queue: QueueName, job: &LeasedJob) -> JobDisposition {
        let tick: MonitorTick = match job.payload_as() {
            Ok(tick) => tick,
            Err(err) => return JobDisposition::Discard(err.to_string()),
        };

        let monitor: MonitorSpec = match self.monitors.get(&tick.monitor_id).await {
            Ok(Some(record)) => match record.try_into() {
                Ok(spec) => spec,
                Err(err) => return JobDisposition::Discard(err),
            },
            Ok(None) => {
                return JobDisposition::Discard(format!(
                    "monitor {} no longer exists",
                    tick.monitor_id
                ))
            }
            Err(err) => return JobDisposition::Retry(err.to_string()),
        };

        match self
            .dispatcher
            .dispatch_monitor_tick(&monitor, self.retry_limit)
            .await
        {
            Ok(_) => JobDisposition::Complete,
            Err(err) => {
                error!(monitor = %monitor.id, error = %err, "Monitor fan-out failed");
                JobDisposition::Retry(err.to_string())
            }
        }
    }
}

struct JobTriggerHandler {
    dispatcher: JobDispatcher,
}

#[async_trait]
impl JobHandler for JobTriggerHandler {
    async fn handle(&self, _queue: QueueName, job: &LeasedJob) -> JobDisposition {
        let trigger: JobTrigger = match job.payload_as() {
            Ok(trigger) => trigger,
            Err(err) => return JobDisposition::Discard(err.to_string()),
        };

        match self.dispatcher.dispatch_job(&trigger).await {
            Ok(()) => JobDisposition::Complete,
            // Validation failures already marked the run failed; retrying
            // would re-create the same rejection.
            Err(dispatch::DispatchError::InvalidJob(message)) => JobDisposition::Discard(message),
            Err(err) => JobDisposition::Retry(err.to_string()),
        }
    }
}

#[handler]
fn healthz() -> &'static str {
    "ok"
}

pub async fn run(config: SchedulerConfig) -> Result<(), anyhow::Error> {
    info!(
        "Starting scheduler with configuration:\n{}",
        config.to_safe_string()
    );

    let redis = RedisPool::configured(&config.redis)
        .await
        .map_err(|err| anyhow!(err.to_string()).context("Redis connection"))?;
    let job_queue: Arc<dyn JobQueue> = Arc::new(RedisJobQueue::new(redis));

    let (monitors, runs): (Arc<dyn MonitorRepo>, Arc<dyn RunRepo>) = match config.db.clone() {
        DbConfig::Postgres(db_config) => {
            let pool = Arc::new(
                create_postgres_pool(&db_config)
                    .await
                    .map_err(|err| anyhow!(err.to_string()))?,
            );
            (
                Arc::new(DbMonitorRepo::new(pool.clone())),
                Arc::new(DbRunRepo::new(pool)),
            )
        }
        DbConfig::Sqlite(db_config) => {
            let pool = Arc::new(
                create_sqlite_pool(&db_config)
                    .await
                    .map_err(|err| anyhow!(err.to_string()))?,
            );
            (
                Arc::new(DbMonitorRepo::new(pool.clone())),
                Arc::new(DbRunRepo::new(pool)),
            )
        }
    };

    let mut join_set: JoinSet<Result<(), anyhow::Error>> = JoinSet::new();
    let shutdown = CancellationToken::new();

    start_http_server(config.http_port, &mut join_set, shutdown.clone()).await?;

    let scheduler_consumer_config = QueueConsumerConfig::default()
        .with_concurrency(4)
        .with_lock_duration(Duration::from_secs(120));

    QueueConsumer::new(
        QueueName::MonitorScheduler,
        job_queue.clone(),
        Arc::new(MonitorTickHandler {
            monitors,
            dispatcher: MonitorDispatcher::new(job_queue.clone()),
            retry_limit: config.monitor_retry_limit,
        }),
        scheduler_consumer_config.clone(),
    )
    .start(&mut join_set, shutdown.clone());

    for queue in [QueueName::JobScheduler, QueueName::K6JobScheduler] {
        QueueConsumer::new(
            queue,
            job_queue.clone(),
            Arc::new(JobTriggerHandler {
                dispatcher: JobDispatcher::new(job_queue.clone(), runs.clone()),
            }),
            scheduler_consumer_config.clone(),
        )
        .start(&mut join_set, shutdown.clone());
    }

    {
        let shutdown = shutdown.clone();
        join_set.spawn(
            async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutdown signal received");
                shutdown.cancel();
                Ok(())
            }
            .in_current_span(),
        );
    }

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                shutdown.cancel();
                return Err(err);
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                shutdown.cancel();
                return Err(anyhow!(err));
            }
        }
    }

    info!("Scheduler stopped");
    Ok(())
}

async fn start_http_server(
    port: u16,
    join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    shutdown: CancellationToken,
) -> Result<u16, anyhow::Error> {
    let app = Route::new().at("/healthz", get(healthz));

    let listener = TcpListener::bind(format!("0.0.0.0:{port}"));
    let acceptor = listener.into_acceptor().await?;
    let bound_port = acceptor.local_addr()[0]
        .as_socket_addr()
        .expect("socket address")
        .port();

    join_set.spawn(
        async move {
            poem::Server::new_with_acceptor(acceptor)
                .run_with_graceful_shutdown(app, shutdown.cancelled(), None)
                .await
                .map_err(|err| err.into())
        }
        .in_current_span(),
    );

    Ok(bound_port)
}
