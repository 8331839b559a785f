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

pub mod active_runs;
pub mod cancellation;
pub mod ports;

use crate::aggregate::alerts::{AlertGate, RedisAlertDebounce};
use crate::aggregate::{AggregationConfig, RedisBarrierStore, ResultAggregator};
use crate::config::WorkerExecutorConfig;
use crate::container::executor::ContainerExecutor;
use crate::k6::K6Runner;
use crate::probes::synthetic::SyntheticProbe;
use crate::probes::MonitorProber;
use crate::services::active_runs::ActiveRunRegistry;
use crate::services::cancellation::{CancellationStore, RedisCancellationStore};
use sqlx::Database;
use std::sync::Arc;
use vantage_common::config::DbConfig;
use vantage_common::queue::redis::RedisJobQueue;
use vantage_common::queue::JobQueue;
use vantage_common::redis::RedisPool;
use vantage_service_base::clients::billing::{
    BillingService, HttpBillingService, PermissiveBillingService,
};
use vantage_service_base::clients::notification::{
    HttpNotificationService, LoggingNotificationService, NotificationService,
};
use vantage_service_base::clients::playwright::{HttpPlaywrightClient, PlaywrightClient};
use vantage_service_base::db::{create_postgres_pool, create_sqlite_pool};
use vantage_service_base::repo::monitor::{DbMonitorRepo, MonitorRepo};
use vantage_service_base::repo::monitor_result::{DbMonitorResultRepo, MonitorResultRepo};
use vantage_service_base::repo::run::{DbRunRepo, RunRepo};
use vantage_service_base::repo::synthetic_test::{DbSyntheticTestRepo, SyntheticTestRepo};
use vantage_service_base::storage;

/// Everything a worker-executor process holds, built leaves-first.
#[derive(Clone)]
pub struct Services {
    pub redis: RedisPool,
    pub job_queue: Arc<dyn JobQueue>,
    pub cancellation: Arc<dyn CancellationStore>,
    pub active_runs: Arc<ActiveRunRegistry>,
    pub executor: Arc<ContainerExecutor>,
    pub k6_runner: Arc<K6Runner>,
    pub prober: Arc<MonitorProber>,
    pub aggregator: Arc<ResultAggregator>,
    pub runs: Arc<dyn RunRepo>,
    pub billing: Arc<dyn BillingService>,
    pub notifications: Arc<dyn NotificationService>,
    pub playwright: Arc<dyn PlaywrightClient>,
}

impl Services {
    pub async fn new(config: &WorkerExecutorConfig) -> Result<Services, String> {
        let redis = RedisPool::configured(&config.redis)
            .await
            .map_err(|err| err.to_string())?;

        match config.db.clone() {
            DbConfig::Postgres(db_config) => {
                let pool = Arc::new(
                    create_postgres_pool(&db_config)
                        .await
                        .map_err(|err| err.to_string())?,
                );
                Self::make_with_db(
                    config,
                    redis,
                    Arc::new(DbMonitorRepo::new(pool.clone())),
                    Arc::new(DbMonitorResultRepo::new(pool.clone())),
                    Arc::new(DbRunRepo::new(pool.clone())),
                    Arc::new(DbSyntheticTestRepo::new(pool)),
                )
                .await
            }
            DbConfig::Sqlite(db_config) => {
                let pool = Arc::new(
                    create_sqlite_pool(&db_config)
                        .await
                        .map_err(|err| err.to_string())?,
                );
                Self::make_with_db(
                    config,
                    redis,
                    Arc::new(DbMonitorRepo::new(pool.clone())),
                    Arc::new(DbMonitorResultRepo::new(pool.clone())),
                    Arc::new(DbRunRepo::new(pool.clone())),
                    Arc::new(DbSyntheticTestRepo::new(pool)),
                )
                .await
            }
        }
    }

    async fn make_with_db<DB>(
        config: &WorkerExecutorConfig,
        redis: RedisPool,
        monitors: Arc<DbMonitorRepo<DB>>,
        results: Arc<DbMonitorResultRepo<DB>>,
        runs: Arc<DbRunRepo<DB>>,
        synthetic_tests: Arc<DbSyntheticTestRepo<DB>>,
    ) -> Result<Services, String>
    where
        DB: Database,
        DbMonitorRepo<DB>: MonitorRepo,
        DbMonitorResultRepo<DB>: MonitorResultRepo,
        DbRunRepo<DB>: RunRepo,
        DbSyntheticTestRepo<DB>: SyntheticTestRepo,
    {
        let monitors: Arc<dyn MonitorRepo> = monitors;
        let results: Arc<dyn MonitorResultRepo> = results;
        let runs: Arc<dyn RunRepo> = runs;
        let synthetic_tests: Arc<dyn SyntheticTestRepo> = synthetic_tests;

        let job_queue: Arc<dyn JobQueue> = Arc::new(RedisJobQueue::new(redis.clone()));

        let cancellation: Arc<dyn CancellationStore> =
            Arc::new(RedisCancellationStore::new(redis.clone()));
        let active_runs = Arc::new(ActiveRunRegistry::new());

        let executor = Arc::new(ContainerExecutor::new(
            config.container.clone(),
            cancellation.clone(),
            active_runs.clone(),
        ));

        let artifact_storage = storage::configured(&config.storage)
            .await
            .map_err(|err| err.to_string())?;

        let k6_runner = Arc::new(K6Runner::new(
            config.k6.clone(),
            executor.clone(),
            active_runs.clone(),
            artifact_storage,
            Some(redis.clone()),
        ));

        let notifications: Arc<dyn NotificationService> = match &config.notification_service {
            Some(remote) => Arc::new(HttpNotificationService::new(remote)),
            None => Arc::new(LoggingNotificationService),
        };

        let billing: Arc<dyn BillingService> = match &config.billing_service {
            Some(remote) => Arc::new(HttpBillingService::new(remote)),
            None => Arc::new(PermissiveBillingService),
        };

        let playwright: Arc<dyn PlaywrightClient> =
            Arc::new(HttpPlaywrightClient::new(&config.playwright_service));

        let prober = Arc::new(MonitorProber::new(
            config.probes.clone(),
            SyntheticProbe::new(synthetic_tests, playwright.clone()),
            results.clone(),
        ));

        let alert_gate = Arc::new(AlertGate::new(
            notifications.clone(),
            results.clone(),
            Arc::new(RedisAlertDebounce::new(redis.clone())),
        ));

        let aggregator = Arc::new(ResultAggregator::new(
            monitors,
            results,
            Arc::new(RedisBarrierStore::new(redis.clone())),
            alert_gate,
            AggregationConfig {
                settle_delay: config.aggregation.settle_delay,
            },
        ));

        Ok(Services {
            redis,
            job_queue,
            cancellation,
            active_runs,
            executor,
            k6_runner,
            prober,
            aggregator,
            runs,
            billing,
            notifications,
            playwright,
        })
    }
}
