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

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;
use vantage_common::model::RunId;
use vantage_common::redis::RedisPool;

pub const CANCELLATION_TTL: Duration = Duration::from_secs(3600);

fn cancel_key(run_id: &RunId) -> String {
    format!("cancel:{run_id}")
}

/// Process-external cancellation flag per run id. All operations are
/// best-effort: when the store is unreachable a run reads as not cancelled,
/// never the other way around.
#[async_trait]
pub trait CancellationStore: Send + Sync {
    async fn set_cancellation(&self, run_id: &RunId);

    async fn is_cancelled(&self, run_id: &RunId) -> bool;

    async fn clear_cancellation(&self, run_id: &RunId);
}

pub struct RedisCancellationStore {
    pool: RedisPool,
}

impl RedisCancellationStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CancellationStore for RedisCancellationStore {
    async fn set_cancellation(&self, run_id: &RunId) {
        if let Err(err) = self
            .pool
            .set_ex(&cancel_key(run_id), "1", CANCELLATION_TTL)
            .await
        {
            warn!(%run_id, error = %err, "Failed to persist cancellation flag");
        }
    }

    async fn is_cancelled(&self, run_id: &RunId) -> bool {
        match self.pool.get(&cancel_key(run_id)).await {
            Ok(value) => value.as_deref() == Some("1"),
            Err(err) => {
                warn!(%run_id, error = %err, "Cancellation check failed, assuming not cancelled");
                false
            }
        }
    }

    async fn clear_cancellation(&self, run_id: &RunId) {
        if let Err(err) = self.pool.del(&cancel_key(run_id)).await {
            warn!(%run_id, error = %err, "Failed to clear cancellation flag");
        }
    }
}

#[derive(Default)]
pub struct InMemoryCancellationStore {
    cancelled: Mutex<HashSet<RunId>>,
}

impl InMemoryCancellationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CancellationStore for InMemoryCancellationStore {
    async fn set_cancellation(&self, run_id: &RunId) {
        self.cancelled.lock().unwrap().insert(*run_id);
    }

    async fn is_cancelled(&self, run_id: &RunId) -> bool {
        self.cancelled.lock().unwrap().contains(run_id)
    }

    async fn clear_cancellation(&self, run_id: &RunId) {
        self.cancelled.lock().unwrap().remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    async fn flag_round_trip() {
        let store = InMemoryCancellationStore::new();
        let run_id = RunId::new_v4();
        assert!(!store.is_cancelled(&run_id).await);
        store.set_cancellation(&run_id).await;
        assert!(store.is_cancelled(&run_id).await);
        store.clear_cancellation(&run_id).await;
        assert!(!store.is_cancelled(&run_id).await);
    }
}
