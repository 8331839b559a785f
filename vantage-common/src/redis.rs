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

use crate::config::RedisConfig;
use fred::prelude::*;
use std::time::Duration;
use tracing::debug;

pub type RedisError = fred::error::Error;

/// Shared key-value service client. All keys written through the pool carry
/// the configured prefix so multiple deployments can share one Redis.
#[derive(Clone)]
pub struct RedisPool {
    pool: Pool,
    key_prefix: String,
}

impl RedisPool {
    pub async fn configured(config: &RedisConfig) -> Result<RedisPool, RedisError> {
        debug!(
            "Creating Redis pool for {}:{} (database {})",
            config.host, config.port, config.database
        );

        let mut redis_config = Config::default();
        redis_config.server = ServerConfig::new_centralized(config.host.clone(), config.port);
        redis_config.database = Some(config.database);
        redis_config.username = config.username.clone();
        redis_config.password = config
            .password
            .as_ref()
            .map(|password| password.reveal().to_string());

        let pool = Builder::from_config(redis_config)
            .with_connection_config(|connection| {
                connection.connection_timeout = Duration::from_secs(5);
                connection.internal_command_timeout = Duration::from_secs(5);
            })
            .build_pool(config.pool_size)?;
        pool.init().await?;

        Ok(RedisPool {
            pool,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RedisError> {
        self.pool
            .set(
                self.key(key),
                value,
                Some(Expiration::EX(ttl.as_secs() as i64)),
                None,
                false,
            )
            .await
    }

    /// SET NX PX; returns true when the key was newly set.
    pub async fn set_nx_px(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, RedisError> {
        let outcome: Option<String> = self
            .pool
            .set(
                self.key(key),
                value,
                Some(Expiration::PX(ttl.as_millis() as i64)),
                Some(SetOptions::NX),
                false,
            )
            .await?;
        Ok(outcome.is_some())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, RedisError> {
        self.pool.get(self.key(key)).await
    }

    pub async fn del(&self, key: &str) -> Result<i64, RedisError> {
        self.pool.del(self.key(key)).await
    }

    pub async fn sadd(&self, key: &str, member: &str) -> Result<i64, RedisError> {
        self.pool.sadd(self.key(key), member).await
    }

    pub async fn scard(&self, key: &str) -> Result<i64, RedisError> {
        self.pool.scard(self.key(key)).await
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, RedisError> {
        self.pool.smembers(self.key(key)).await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, RedisError> {
        self.pool
            .expire(self.key(key), ttl.as_secs() as i64, None)
            .await
    }

    pub async fn publish(&self, channel: &str, message: &str) -> Result<i64, RedisError> {
        self.pool.next().publish(self.key(channel), message).await
    }

    pub async fn lpush(&self, key: &str, value: &str) -> Result<i64, RedisError> {
        self.pool.lpush(self.key(key), value).await
    }

    pub async fn rpush(&self, key: &str, value: &str) -> Result<i64, RedisError> {
        self.pool.rpush(self.key(key), value).await
    }

    pub async fn rpoplpush(&self, source: &str, dest: &str) -> Result<Option<String>, RedisError> {
        self.pool
            .rpoplpush(self.key(source), self.key(dest))
            .await
    }

    pub async fn lrem(&self, key: &str, count: i64, element: &str) -> Result<i64, RedisError> {
        self.pool.lrem(self.key(key), count, element).await
    }

    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, RedisError> {
        self.pool.lrange(self.key(key), start, stop).await
    }

    pub async fn llen(&self, key: &str) -> Result<i64, RedisError> {
        self.pool.llen(self.key(key)).await
    }

    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<i64, RedisError> {
        self.pool
            .zadd(self.key(key), None, None, false, false, (score, member))
            .await
    }

    pub async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<i64>,
    ) -> Result<Vec<String>, RedisError> {
        self.pool
            .zrangebyscore(
                self.key(key),
                min,
                max,
                false,
                limit.map(|count| (0, count)),
            )
            .await
    }

    pub async fn zrem(&self, key: &str, member: &str) -> Result<i64, RedisError> {
        self.pool.zrem(self.key(key), member).await
    }

    pub async fn zcard(&self, key: &str) -> Result<i64, RedisError> {
        self.pool.zcard(self.key(key)).await
    }

    pub async fn zremrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<i64, RedisError> {
        self.pool.zremrangebyscore(self.key(key), min, max).await
    }

    pub async fn zremrangebyrank(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<i64, RedisError> {
        self.pool.zremrangebyrank(self.key(key), start, stop).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, RedisError> {
        let count: i64 = self.pool.exists(self.key(key)).await?;
        Ok(count > 0)
    }
}
