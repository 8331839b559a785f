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
use chrono::{DateTime, Utc};
use sqlx::{Database, Pool};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use uuid::Uuid;
use vantage_common::model::{MonitorSpec, MonitorStatus};

/// The monitors table is owned by the REST surface. The execution fabric
/// reads the spec and writes back nothing but the aggregate status and the
/// two bookkeeping timestamps.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct MonitorRecord {
    pub monitor_id: Uuid,
    pub spec: String,
    pub status: String,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_status_change_at: Option<DateTime<Utc>>,
}

impl TryFrom<MonitorRecord> for MonitorSpec {
    type Error = String;

    fn try_from(value: MonitorRecord) -> Result<Self, Self::Error> {
        let mut spec: MonitorSpec = serde_json::from_str(&value.spec)
            .map_err(|e| format!("Invalid monitor spec: {e}"))?;
        // Columns are authoritative over the serialized copy for the fields
        // the aggregator mutates.
        spec.status = value
            .status
            .parse::<MonitorStatus>()
            .map_err(|e| format!("Invalid monitor status: {e}"))?;
        spec.last_check_at = value.last_check_at;
        spec.last_status_change_at = value.last_status_change_at;
        Ok(spec)
    }
}

#[async_trait]
pub trait MonitorRepo: Send + Sync {
    async fn get(&self, monitor_id: &Uuid) -> Result<Option<MonitorRecord>, RepoError>;

    async fn update_status(
        &self,
        monitor_id: &Uuid,
        status: &str,
        changed_at: &DateTime<Utc>,
    ) -> Result<(), RepoError>;

    async fn update_last_check(
        &self,
        monitor_id: &Uuid,
        checked_at: &DateTime<Utc>,
    ) -> Result<(), RepoError>;
}

pub struct DbMonitorRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbMonitorRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl MonitorRepo for DbMonitorRepo<sqlx::Postgres> {
    async fn get(&self, monitor_id: &Uuid) -> Result<Option<MonitorRecord>, RepoError> {
        sqlx::query_as::<_, MonitorRecord>(
            "SELECT monitor_id, spec, status, last_check_at, last_status_change_at FROM monitors WHERE monitor_id = $1",
        )
        .bind(monitor_id)
        .fetch_optional(&*self.db_pool)
        .await
        .map_err(|e| e.into())
    }

    async fn update_status(
        &self,
        monitor_id: &Uuid,
        status: &str,
        changed_at: &DateTime<Utc>,
    ) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE monitors SET status = $2, last_status_change_at = $3 WHERE monitor_id = $1",
        )
        .bind(monitor_id)
        .bind(status)
        .bind(changed_at)
        .execute(&*self.db_pool)
        .await?;
        Ok(())
    }

    async fn update_last_check(
        &self,
        monitor_id: &Uuid,
        checked_at: &DateTime<Utc>,
    ) -> Result<(), RepoError> {
        sqlx::query("UPDATE monitors SET last_check_at = $2 WHERE monitor_id = $1")
            .bind(monitor_id)
            .bind(checked_at)
            .execute(&*self.db_pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MonitorRepo for DbMonitorRepo<sqlx::Sqlite> {
    async fn get(&self, monitor_id: &Uuid) -> Result<Option<MonitorRecord>, RepoError> {
        sqlx::query_as::<_, MonitorRecord>(
            "SELECT monitor_id, spec, status, last_check_at, last_status_change_at FROM monitors WHERE monitor_id = $1",
        )
        .bind(monitor_id)
        .fetch_optional(&*self.db_pool)
        .await
        .map_err(|e| e.into())
    }

    async fn update_status(
        &self,
        monitor_id: &Uuid,
        status: &str,
        changed_at: &DateTime<Utc>,
    ) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE monitors SET status = $2, last_status_change_at = $3 WHERE monitor_id = $1",
        )
        .bind(monitor_id)
        .bind(status)
        .bind(changed_at)
        .execute(&*self.db_pool)
        .await?;
        Ok(())
    }

    async fn update_last_check(
        &self,
        monitor_id: &Uuid,
        checked_at: &DateTime<Utc>,
    ) -> Result<(), RepoError> {
        sqlx::query("UPDATE monitors SET last_check_at = $2 WHERE monitor_id = $1")
            .bind(monitor_id)
            .bind(checked_at)
            .execute(&*self.db_pool)
            .await?;
        Ok(())
    }
}

/// Test double with the same observable behavior.
#[derive(Default)]
pub struct InMemoryMonitorRepo {
    records: Mutex<HashMap<Uuid, MonitorRecord>>,
}

impl InMemoryMonitorRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: MonitorRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.monitor_id, record);
    }

    pub fn insert_spec(&self, spec: &MonitorSpec) {
        self.insert(MonitorRecord {
            monitor_id: spec.id.0,
            spec: serde_json::to_string(spec).expect("monitor spec is serializable"),
            status: spec.status.to_string(),
            last_check_at: spec.last_check_at,
            last_status_change_at: spec.last_status_change_at,
        });
    }
}

#[async_trait]
impl MonitorRepo for InMemoryMonitorRepo {
    async fn get(&self, monitor_id: &Uuid) -> Result<Option<MonitorRecord>, RepoError> {
        Ok(self.records.lock().unwrap().get(monitor_id).cloned())
    }

    async fn update_status(
        &self,
        monitor_id: &Uuid,
        status: &str,
        changed_at: &DateTime<Utc>,
    ) -> Result<(), RepoError> {
        if let Some(record) = self.records.lock().unwrap().get_mut(monitor_id) {
            record.status = status.to_string();
            record.last_status_change_at = Some(*changed_at);
        }
        Ok(())
    }

    async fn update_last_check(
        &self,
        monitor_id: &Uuid,
        checked_at: &DateTime<Utc>,
    ) -> Result<(), RepoError> {
        if let Some(record) = self.records.lock().unwrap().get_mut(monitor_id) {
            record.last_check_at = Some(*checked_at);
        }
        Ok(())
    }
}
