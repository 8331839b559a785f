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

use crate::model::Secret;
use crate::SafeDisplay;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "VANTAGE__";
const ENV_SEPARATOR: &str = "__";

/// A named example configuration, rendered by `--dump-config-examples`.
pub type ConfigExample<T> = (&'static str, T);

pub trait HasConfigExamples<T> {
    fn examples() -> Vec<ConfigExample<T>>;
}

pub trait ConfigLoaderConfig:
    Default + Serialize + DeserializeOwned + HasConfigExamples<Self>
{
}

impl<T: Default + Serialize + DeserializeOwned + HasConfigExamples<T>> ConfigLoaderConfig for T {}

/// Layered configuration loader: compiled-in defaults, then the service's
/// TOML file, then `VANTAGE__`-prefixed environment overrides.
pub struct ConfigLoader<T: ConfigLoaderConfig> {
    pub config_file_name: PathBuf,
    phantom: PhantomData<T>,
}

impl<T: ConfigLoaderConfig> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> ConfigLoader<T> {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            phantom: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(self.config_file_name.clone()))
            .merge(Env::prefixed(ENV_PREFIX).split(ENV_SEPARATOR))
    }

    pub fn load(&self) -> figment::Result<T> {
        self.figment().extract()
    }

    /// Regular startup path: honours `--dump-config` and
    /// `--dump-config-examples` by printing the rendered TOML and returning
    /// `None` so the server exits without starting.
    pub fn load_or_dump_config(&self) -> Option<T> {
        let args: Vec<String> = std::env::args().collect();
        if args.iter().any(|arg| arg == "--dump-config") {
            match toml::to_string(&T::default()) {
                Ok(rendered) => println!("{rendered}"),
                Err(err) => eprintln!("Failed to render default config: {err}"),
            }
            None
        } else if args.iter().any(|arg| arg == "--dump-config-examples") {
            for (name, example) in T::examples() {
                match toml::to_string(&example) {
                    Ok(rendered) => println!("# {name}\n{rendered}"),
                    Err(err) => eprintln!("Failed to render config example {name}: {err}"),
                }
            }
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(err) => {
                    eprintln!("Failed to load config: {err}");
                    std::process::exit(1);
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl SafeDisplay for RetryConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "max attempts: {}, min delay: {:?}, max delay: {:?}, multiplier: {}",
            self.max_attempts, self.min_delay, self.max_delay, self.multiplier
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub database: u8,
    pub key_prefix: String,
    pub pool_size: usize,
    pub username: Option<String>,
    pub password: Option<Secret>,
    pub retries: RetryConfig,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.database)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            database: 0,
            key_prefix: "".to_string(),
            pool_size: 8,
            username: None,
            password: None,
            retries: RetryConfig::default(),
        }
    }
}

impl SafeDisplay for RedisConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "host: {}", self.host);
        let _ = writeln!(&mut result, "port: {}", self.port);
        let _ = writeln!(&mut result, "database: {}", self.database);
        let _ = writeln!(&mut result, "key prefix: {}", self.key_prefix);
        let _ = writeln!(&mut result, "pool size: {}", self.pool_size);
        if self.username.is_some() {
            let _ = writeln!(&mut result, "username: ****");
        }
        if self.password.is_some() {
            let _ = writeln!(&mut result, "password: ****");
        }
        let _ = writeln!(&mut result, "retries: {}", self.retries.to_safe_string());
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "config")]
pub enum DbConfig {
    Postgres(DbPostgresConfig),
    Sqlite(DbSqliteConfig),
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig::Sqlite(DbSqliteConfig::default())
    }
}

impl SafeDisplay for DbConfig {
    fn to_safe_string(&self) -> String {
        match self {
            DbConfig::Postgres(inner) => {
                format!("postgres:\n{}", inner.to_safe_string_indented())
            }
            DbConfig::Sqlite(inner) => format!("sqlite:\n{}", inner.to_safe_string_indented()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbPostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: Secret,
    pub max_connections: u32,
    pub schema: Option<String>,
}

impl Default for DbPostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "vantage".to_string(),
            username: "postgres".to_string(),
            password: Secret::new("postgres"),
            max_connections: 10,
            schema: None,
        }
    }
}

impl SafeDisplay for DbPostgresConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "host: {}", self.host);
        let _ = writeln!(&mut result, "port: {}", self.port);
        let _ = writeln!(&mut result, "database: {}", self.database);
        let _ = writeln!(&mut result, "username: {}", self.username);
        let _ = writeln!(&mut result, "password: ****");
        let _ = writeln!(&mut result, "max connections: {}", self.max_connections);
        if let Some(schema) = &self.schema {
            let _ = writeln!(&mut result, "schema: {schema}");
        }
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbSqliteConfig {
    pub database: String,
    pub max_connections: u32,
    pub foreign_keys: bool,
}

impl Default for DbSqliteConfig {
    fn default() -> Self {
        Self {
            database: "vantage.sqlite".to_string(),
            max_connections: 10,
            foreign_keys: true,
        }
    }
}

impl SafeDisplay for DbSqliteConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "database: {}", self.database);
        let _ = writeln!(&mut result, "max connections: {}", self.max_connections);
        let _ = writeln!(&mut result, "foreign keys: {}", self.foreign_keys);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
    struct TestConfig {
        name: String,
        retries: RetryConfig,
    }

    impl HasConfigExamples<TestConfig> for TestConfig {
        fn examples() -> Vec<ConfigExample<TestConfig>> {
            vec![]
        }
    }

    #[test]
    fn defaults_load_without_a_config_file() {
        let loader: ConfigLoader<TestConfig> =
            ConfigLoader::new(&PathBuf::from("config/does-not-exist.toml"));
        let config = loader.load().expect("Failed to load config");
        assert_eq!(config, TestConfig::default());
    }
}
