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

pub mod aggregate;
pub mod config;
pub mod container;
pub mod k6;
pub mod metrics;
pub mod probes;
pub mod services;
pub mod worker;

use crate::config::WorkerExecutorConfig;
use crate::services::Services;
use crate::worker::{
    K6JobHandler, MonitorJobHandler, PlaywrightJobHandler, WorkerLocation,
};
use anyhow::anyhow;
use poem::endpoint::PrometheusExporter;
use poem::listener::{Acceptor, Listener, TcpListener};
use poem::{get, handler, Route};
use prometheus::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};
use vantage_common::queue::consumer::{QueueConsumer, QueueConsumerConfig};
use vantage_common::queue::QueueName;
use vantage_common::SafeDisplay;

#[cfg(test)]
test_r::enable!();

pub struct RunDetails {
    pub http_port: u16,
}

#[handler]
fn healthz() -> &'static str {
    "ok"
}

/// Starts the regional worker: queue consumers for its subscriptions, the
/// health/metrics endpoint, and a queue-depth sampler. Resolves when every
/// task finished after a shutdown signal.
pub async fn run(
    config: WorkerExecutorConfig,
    prometheus_registry: Registry,
) -> Result<(), anyhow::Error> {
    info!(
        "Starting worker executor with configuration:\n{}",
        config.to_safe_string()
    );

    let worker_location = WorkerLocation::parse(&config.worker_location, config.is_production())
        .map_err(|err| anyhow!(err))?;

    let services = Services::new(&config)
        .await
        .map_err(|err| anyhow!(err).context("Service initialization"))?;

    let mut join_set: JoinSet<Result<(), anyhow::Error>> = JoinSet::new();
    let shutdown = CancellationToken::new();

    let http_port = start_http_server(
        config.http_port,
        prometheus_registry,
        &mut join_set,
        shutdown.clone(),
    )
    .await?;
    info!(port = http_port, "Health and metrics endpoint started");

    start_consumers(&config, worker_location, &services, &mut join_set, &shutdown);
    start_queue_depth_sampler(worker_location, &config, &services, &mut join_set, &shutdown);

    {
        let shutdown = shutdown.clone();
        join_set.spawn(
            async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutdown signal received, draining in-flight work");
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

    info!("Worker executor stopped");
    Ok(())
}

fn start_consumers(
    config: &WorkerExecutorConfig,
    worker_location: WorkerLocation,
    services: &Services,
    join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    shutdown: &CancellationToken,
) {
    let monitor_handler = Arc::new(MonitorJobHandler {
        worker_location,
        enable_location_filtering: config.enable_location_filtering,
        prober: services.prober.clone(),
        aggregator: services.aggregator.clone(),
    });
    for queue in worker_location.monitor_queues() {
        QueueConsumer::new(
            queue,
            services.job_queue.clone(),
            monitor_handler.clone(),
            QueueConsumerConfig::default()
                .with_concurrency(config.queues.monitor_concurrency)
                .with_lock_duration(Duration::from_secs(300)),
        )
        .start(join_set, shutdown.clone());
    }

    let playwright_handler = Arc::new(PlaywrightJobHandler {
        worker_location,
        runs: services.runs.clone(),
        billing: services.billing.clone(),
        cancellation: services.cancellation.clone(),
        playwright: services.playwright.clone(),
        notifications: services.notifications.clone(),
    });
    QueueConsumer::new(
        QueueName::PlaywrightGlobal,
        services.job_queue.clone(),
        playwright_handler,
        QueueConsumerConfig::default()
            .with_concurrency(config.queues.playwright_concurrency)
            .with_lock_duration(Duration::from_secs(300)),
    )
    .start(join_set, shutdown.clone());

    let k6_handler = Arc::new(K6JobHandler {
        worker_location,
        enable_location_filtering: config.enable_location_filtering,
        runner: services.k6_runner.clone(),
        runs: services.runs.clone(),
        billing: services.billing.clone(),
        cancellation: services.cancellation.clone(),
        notifications: services.notifications.clone(),
    });
    for queue in worker_location.k6_queues(config.k6_queue_mode) {
        // Horizontal scaling only: one k6 execution per worker process.
        QueueConsumer::new(
            queue,
            services.job_queue.clone(),
            k6_handler.clone(),
            QueueConsumerConfig::default()
                .with_concurrency(1)
                .with_lock_duration(Duration::from_secs(300)),
        )
        .start(join_set, shutdown.clone());
    }
}

fn start_queue_depth_sampler(
    worker_location: WorkerLocation,
    config: &WorkerExecutorConfig,
    services: &Services,
    join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    shutdown: &CancellationToken,
) {
    let job_queue = services.job_queue.clone();
    let shutdown = shutdown.clone();
    let mut queues = worker_location.monitor_queues();
    queues.push(QueueName::PlaywrightGlobal);
    queues.extend(worker_location.k6_queues(config.k6_queue_mode));

    join_set.spawn(
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(15));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for queue in &queues {
                            match job_queue.depth(*queue).await {
                                Ok(depth) => {
                                    metrics::QUEUE_DEPTH
                                        .with_label_values(&[queue.as_str()])
                                        .set(depth as i64);
                                }
                                Err(err) => {
                                    warn!(%queue, error = %err, "Queue depth sampling failed");
                                }
                            }
                        }
                    }
                }
            }
            Ok(())
        }
        .in_current_span(),
    );
}

async fn start_http_server(
    port: u16,
    prometheus_registry: Registry,
    join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    shutdown: CancellationToken,
) -> Result<u16, anyhow::Error> {
    let app = Route::new()
        .at("/healthz", get(healthz))
        .nest("/metrics", PrometheusExporter::new(prometheus_registry));

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
