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

use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use vantage_common::config::{ConfigExample, ConfigLoader, DbConfig, HasConfigExamples, RedisConfig};
use vantage_common::tracing::TracingConfig;
use vantage_common::SafeDisplay;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tracing: TracingConfig,
    pub environment: String,
    pub http_port: u16,
    pub redis: RedisConfig,
    pub db: DbConfig,
    /// Attempts given to fanned-out monitor jobs.
    pub monitor_retry_limit: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("vantage-scheduler"),
            environment: "dev".to_string(),
            http_port: 9091,
            redis: RedisConfig::default(),
            db: DbConfig::default(),
            monitor_retry_limit: 2,
        }
    }
}

impl SafeDisplay for SchedulerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "environment: {}", self.environment);
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(&mut result, "redis:");
        let _ = writeln!(&mut result, "{}", self.redis.to_safe_string_indented());
        let _ = writeln!(&mut result, "db:");
        let _ = writeln!(&mut result, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(
            &mut result,
            "monitor retry limit: {}",
            self.monitor_retry_limit
        );
        result
    }
}

impl HasConfigExamples<SchedulerConfig> for SchedulerConfig {
    fn examples() -> Vec<ConfigExample<SchedulerConfig>> {
        vec![(
            "production scheduler",
            SchedulerConfig {
                environment: "production".to_string(),
                ..SchedulerConfig::default()
            },
        )]
    }
}

pub fn make_config_loader() -> ConfigLoader<SchedulerConfig> {
    ConfigLoader::new(&PathBuf::from("config/scheduler.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    pub fn config_is_loadable() {
        make_config_loader().load().expect("Failed to load config");
    }
}
