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

use crate::aggregate::AggregationConfig;
use crate::container::executor::ContainerRuntimeConfig;
use crate::k6::K6RunnerConfig;
use crate::probes::ProbeConfig;
use crate::worker::{K6QueueMode, WorkerQueuesConfig};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use vantage_common::config::{
    ConfigExample, ConfigLoader, DbConfig, HasConfigExamples, RedisConfig,
};
use vantage_common::tracing::TracingConfig;
use vantage_common::SafeDisplay;
use vantage_service_base::config::{ArtifactStorageConfig, RemoteServiceConfig};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerExecutorConfig {
    pub tracing: TracingConfig,
    pub environment: String,
    pub http_port: u16,
    pub worker_location: String,
    pub enable_location_filtering: bool,
    pub k6_queue_mode: K6QueueMode,
    pub redis: RedisConfig,
    pub db: DbConfig,
    pub storage: ArtifactStorageConfig,
    pub container: ContainerRuntimeConfig,
    pub k6: K6RunnerConfig,
    pub probes: ProbeConfig,
    pub queues: WorkerQueuesConfig,
    pub aggregation: AggregationConfig,
    pub notification_service: Option<RemoteServiceConfig>,
    pub billing_service: Option<RemoteServiceConfig>,
    pub playwright_service: RemoteServiceConfig,
}

impl WorkerExecutorConfig {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// The deployment contract names a handful of plain environment
    /// variables; they win over the layered configuration.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(location) = std::env::var("WORKER_LOCATION") {
            self.worker_location = location;
        }
        if let Ok(filtering) = std::env::var("ENABLE_LOCATION_FILTERING") {
            self.enable_location_filtering =
                filtering == "1" || filtering.eq_ignore_ascii_case("true");
        }
        if let Ok(image) = std::env::var("WORKER_IMAGE") {
            self.k6.image = image;
        }
        if let Ok(profile) = std::env::var("SECCOMP_PROFILE_PATH") {
            self.container.seccomp_profile_path = Some(profile);
        }
        if let Ok(port) = std::env::var("K6_WEB_DASHBOARD_START_PORT") {
            self.k6.dashboard.start_port = port.parse().ok();
        }
        if let Ok(range) = std::env::var("K6_WEB_DASHBOARD_PORT_RANGE") {
            if let Ok(range) = range.parse() {
                self.k6.dashboard.port_range = range;
            }
        }
        if let Ok(addr) = std::env::var("K6_WEB_DASHBOARD_ADDR") {
            self.k6.dashboard.bind_addr = addr;
        }
        if let Ok(attempts) = std::env::var("K6_WEB_DASHBOARD_MAX_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse() {
                self.k6.max_dashboard_attempts = attempts;
            }
        }
        if let Ok(allow) = std::env::var("ALLOW_INTERNAL_TARGETS") {
            self.probes.allow_internal_targets =
                allow == "1" || allow.eq_ignore_ascii_case("true");
        }
        if let Ok(node_env) = std::env::var("NODE_ENV") {
            if node_env == "production" {
                self.environment = "production".to_string();
            }
        }
        self
    }
}

impl Default for WorkerExecutorConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("vantage-worker-executor"),
            environment: "dev".to_string(),
            http_port: 9090,
            worker_location: "local".to_string(),
            enable_location_filtering: true,
            k6_queue_mode: K6QueueMode::default(),
            redis: RedisConfig::default(),
            db: DbConfig::default(),
            storage: ArtifactStorageConfig::default(),
            container: ContainerRuntimeConfig::default(),
            k6: K6RunnerConfig::default(),
            probes: ProbeConfig::default(),
            queues: WorkerQueuesConfig::default(),
            aggregation: AggregationConfig::default(),
            notification_service: None,
            billing_service: None,
            playwright_service: RemoteServiceConfig::default(),
        }
    }
}

impl SafeDisplay for WorkerExecutorConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "environment: {}", self.environment);
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(&mut result, "worker location: {}", self.worker_location);
        let _ = writeln!(
            &mut result,
            "location filtering: {}",
            self.enable_location_filtering
        );
        let _ = writeln!(&mut result, "k6 queue mode: {:?}", self.k6_queue_mode);
        let _ = writeln!(&mut result, "redis:");
        let _ = writeln!(&mut result, "{}", self.redis.to_safe_string_indented());
        let _ = writeln!(&mut result, "db:");
        let _ = writeln!(&mut result, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(&mut result, "storage:");
        let _ = writeln!(&mut result, "{}", self.storage.to_safe_string_indented());
        let _ = writeln!(
            &mut result,
            "container runtime: {}",
            self.container.to_safe_string()
        );
        let _ = writeln!(&mut result, "probes: {}", self.probes.to_safe_string());
        if let Some(notifications) = &self.notification_service {
            let _ = writeln!(&mut result, "notification service:");
            let _ = writeln!(&mut result, "{}", notifications.to_safe_string_indented());
        }
        if let Some(billing) = &self.billing_service {
            let _ = writeln!(&mut result, "billing service:");
            let _ = writeln!(&mut result, "{}", billing.to_safe_string_indented());
        }
        let _ = writeln!(&mut result, "playwright service:");
        let _ = writeln!(
            &mut result,
            "{}",
            self.playwright_service.to_safe_string_indented()
        );
        result
    }
}

impl HasConfigExamples<WorkerExecutorConfig> for WorkerExecutorConfig {
    fn examples() -> Vec<ConfigExample<WorkerExecutorConfig>> {
        vec![(
            "regional production worker",
            WorkerExecutorConfig {
                environment: "production".to_string(),
                worker_location: "us-east".to_string(),
                ..WorkerExecutorConfig::default()
            },
        )]
    }
}

pub fn make_config_loader() -> ConfigLoader<WorkerExecutorConfig> {
    ConfigLoader::new(&PathBuf::from("config/worker-executor.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    pub fn config_is_loadable() {
        make_config_loader().load().expect("Failed to load config");
    }

    #[test]
    pub fn default_config_is_dev_local() {
        let config = WorkerExecutorConfig::default();
        assert!(!config.is_production());
        assert_eq!(config.worker_location, "local");
        assert_eq!(config.k6.max_dashboard_attempts, 5);
        assert_eq!(config.k6.memory_mb, 1536);
    }
}
