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

use crate::repo::RepoError;
use async_trait::async_trait;
use sqlx::{Database, Pool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Test definitions are owned by the REST surface; the synthetic probe only
/// reads the referenced script.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct SyntheticTestRecord {
    pub test_id: Uuid,
    pub name: String,
    /// Base64-encoded script body.
    pub script: String,
}

#[async_trait]
pub trait SyntheticTestRepo: Send + Sync {
    async fn get(&self, test_id: &Uuid) -> Result<Option<SyntheticTestRecord>, RepoError>;
}

pub struct DbSyntheticTestRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbSyntheticTestRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

const SELECT_TEST: &str = "SELECT test_id, name, script FROM synthetic_tests WHERE test_id = $1";

#[async_trait]
impl SyntheticTestRepo for DbSyntheticTestRepo<sqlx::Postgres> {
    async fn get(&self, test_id: &Uuid) -> Result<Option<SyntheticTestRecord>, RepoError> {
        sqlx::query_as::<_, SyntheticTestRecord>(SELECT_TEST)
            .bind(test_id)
            .fetch_optional(&*self.db_pool)
            .await
            .map_err(|e| e.into())
    }
}

#[async_trait]
impl SyntheticTestRepo for DbSyntheticTestRepo<sqlx::Sqlite> {
    async fn get(&self, test_id: &Uuid) -> Result<Option<SyntheticTestRecord>, RepoError> {
        sqlx::query_as::<_, SyntheticTestRecord>(SELECT_TEST)
            .bind(test_id)
            .fetch_optional(&*self.db_pool)
            .await
            .map_err(|e| e.into())
    }
}

#[derive(Default)]
pub struct InMemorySyntheticTestRepo {
    tests: Mutex<HashMap<Uuid, SyntheticTestRecord>>,
}

impl InMemorySyntheticTestRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: SyntheticTestRecord) {
        self.tests.lock().unwrap().insert(record.test_id, record);
    }
}

#[async_trait]
impl SyntheticTestRepo for InMemorySyntheticTestRepo {
    async fn get(&self, test_id: &Uuid) -> Result<Option<SyntheticTestRecord>, RepoError> {
        Ok(self.tests.lock().unwrap().get(test_id).cloned())
    }
}
