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
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use vantage_common::model::{
    ExecutionGroupId, LocationCode, MonitorId, MonitorResultRecord, ResultStatus,
};

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct MonitorResultRow {
    pub id: i64,
    pub monitor_id: Uuid,
    pub location: String,
    pub checked_at: DateTime<Utc>,
    pub status: String,
    pub is_up: bool,
    pub response_time_ms: Option<i64>,
    pub details: String,
    pub execution_group_id: Option<String>,
    pub consecutive_failure_count: i64,
    pub consecutive_success_count: i64,
    pub alerts_sent_for_failure: i64,
    pub alerts_sent_for_recovery: i64,
    pub is_status_change: bool,
}

impl TryFrom<MonitorResultRow> for MonitorResultRecord {
    type Error = String;

    fn try_from(value: MonitorResultRow) -> Result<Self, Self::Error> {
        Ok(MonitorResultRecord {
            monitor_id: MonitorId(value.monitor_id),
            location: LocationCode::from_str(&value.location)?,
            checked_at: value.checked_at,
            status: ResultStatus::from_str(&value.status)?,
            is_up: value.is_up,
            response_time_ms: value.response_time_ms.map(|ms| ms.max(0) as u64),
            details: serde_json::from_str(&value.details)
                .map_err(|e| format!("Invalid result details: {e}"))?,
            execution_group_id: value.execution_group_id.map(ExecutionGroupId::from_string),
            consecutive_failure_count: value.consecutive_failure_count.max(0) as u32,
            consecutive_success_count: value.consecutive_success_count.max(0) as u32,
            alerts_sent_for_failure: value.alerts_sent_for_failure.max(0) as u32,
            alerts_sent_for_recovery: value.alerts_sent_for_recovery.max(0) as u32,
            is_status_change: value.is_status_change,
        })
    }
}

/// Append-only per-(monitor, location) result series, plus the queries the
/// aggregator and the alert gate need.
#[async_trait]
pub trait MonitorResultRepo: Send + Sync {
    async fn insert(&self, record: &MonitorResultRecord) -> Result<(), RepoError>;

    /// Most recent row of the (monitor, location) series, used to derive the
    /// consecutive counters of the next row.
    async fn latest_for_location(
        &self,
        monitor_id: &MonitorId,
        location: LocationCode,
    ) -> Result<Option<MonitorResultRow>, RepoError>;

    /// Latest row per location within one execution group; the aggregator's
    /// read after winning the barrier.
    async fn latest_per_location_for_group(
        &self,
        monitor_id: &MonitorId,
        execution_group_id: &ExecutionGroupId,
    ) -> Result<Vec<MonitorResultRow>, RepoError>;

    async fn increment_failure_alerts(
        &self,
        monitor_id: &MonitorId,
        location: LocationCode,
    ) -> Result<(), RepoError>;

    async fn increment_recovery_alerts(
        &self,
        monitor_id: &MonitorId,
        location: LocationCode,
    ) -> Result<(), RepoError>;
}

pub struct DbMonitorResultRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbMonitorResultRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

const INSERT_RESULT: &str = r#"
  INSERT INTO monitor_results
    (monitor_id, location, checked_at, status, is_up, response_time_ms, details,
     execution_group_id, consecutive_failure_count, consecutive_success_count,
     alerts_sent_for_failure, alerts_sent_for_recovery, is_status_change)
  VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
"#;

const SELECT_COLUMNS: &str = r#"id, monitor_id, location, checked_at, status, is_up, response_time_ms, details, execution_group_id, consecutive_failure_count, consecutive_success_count, alerts_sent_for_failure, alerts_sent_for_recovery, is_status_change"#;

const INCREMENT_FAILURE_ALERTS: &str = r#"
  UPDATE monitor_results
  SET alerts_sent_for_failure = alerts_sent_for_failure + 1
  WHERE id = (
    SELECT id FROM monitor_results
    WHERE monitor_id = $1 AND location = $2
    ORDER BY checked_at DESC, id DESC
    LIMIT 1
  )
"#;

const INCREMENT_RECOVERY_ALERTS: &str = r#"
  UPDATE monitor_results
  SET alerts_sent_for_recovery = alerts_sent_for_recovery + 1
  WHERE id = (
    SELECT id FROM monitor_results
    WHERE monitor_id = $1 AND location = $2
    ORDER BY checked_at DESC, id DESC
    LIMIT 1
  )
"#;

macro_rules! monitor_result_repo_impl {
    ($db:ty) => {
        #[async_trait]
        impl MonitorResultRepo for DbMonitorResultRepo<$db> {
            async fn insert(&self, record: &MonitorResultRecord) -> Result<(), RepoError> {
                sqlx::query(INSERT_RESULT)
                    .bind(record.monitor_id.0)
                    .bind(record.location.to_string())
                    .bind(record.checked_at)
                    .bind(record.status.to_string())
                    .bind(record.is_up)
                    .bind(record.response_time_ms.map(|ms| ms as i64))
                    .bind(
                        serde_json::to_string(&record.details)
                            .unwrap_or_else(|_| "null".into()),
                    )
                    .bind(
                        record
                            .execution_group_id
                            .as_ref()
                            .map(|group| group.as_str().to_string()),
                    )
                    .bind(record.consecutive_failure_count as i64)
                    .bind(record.consecutive_success_count as i64)
                    .bind(record.alerts_sent_for_failure as i64)
                    .bind(record.alerts_sent_for_recovery as i64)
                    .bind(record.is_status_change)
                    .execute(&*self.db_pool)
                    .await?;
                Ok(())
            }

            async fn latest_for_location(
                &self,
                monitor_id: &MonitorId,
                location: LocationCode,
            ) -> Result<Option<MonitorResultRow>, RepoError> {
                sqlx::query_as::<_, MonitorResultRow>(&format!(
                    "SELECT {SELECT_COLUMNS} FROM monitor_results WHERE monitor_id = $1 AND location = $2 ORDER BY checked_at DESC, id DESC LIMIT 1"
                ))
                .bind(monitor_id.0)
                .bind(location.to_string())
                .fetch_optional(&*self.db_pool)
                .await
                .map_err(|e| e.into())
            }

            async fn latest_per_location_for_group(
                &self,
                monitor_id: &MonitorId,
                execution_group_id: &ExecutionGroupId,
            ) -> Result<Vec<MonitorResultRow>, RepoError> {
                let rows = sqlx::query_as::<_, MonitorResultRow>(&format!(
                    "SELECT {SELECT_COLUMNS} FROM monitor_results WHERE monitor_id = $1 AND execution_group_id = $2 ORDER BY checked_at ASC, id ASC"
                ))
                .bind(monitor_id.0)
                .bind(execution_group_id.as_str())
                .fetch_all(&*self.db_pool)
                .await?;

                // Later rows win; one row per location survives.
                let mut latest: HashMap<String, MonitorResultRow> = HashMap::new();
                for row in rows {
                    latest.insert(row.location.clone(), row);
                }
                Ok(latest.into_values().collect())
            }

            async fn increment_failure_alerts(
                &self,
                monitor_id: &MonitorId,
                location: LocationCode,
            ) -> Result<(), RepoError> {
                sqlx::query(INCREMENT_FAILURE_ALERTS)
                    .bind(monitor_id.0)
                    .bind(location.to_string())
                    .execute(&*self.db_pool)
                    .await?;
                Ok(())
            }

            async fn increment_recovery_alerts(
                &self,
                monitor_id: &MonitorId,
                location: LocationCode,
            ) -> Result<(), RepoError> {
                sqlx::query(INCREMENT_RECOVERY_ALERTS)
                    .bind(monitor_id.0)
                    .bind(location.to_string())
                    .execute(&*self.db_pool)
                    .await?;
                Ok(())
            }
        }
    };
}

monitor_result_repo_impl!(sqlx::Postgres);
monitor_result_repo_impl!(sqlx::Sqlite);

#[derive(Default)]
pub struct InMemoryMonitorResultRepo {
    rows: Mutex<Vec<MonitorResultRow>>,
}

impl InMemoryMonitorResultRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_rows(&self) -> Vec<MonitorResultRow> {
        self.rows.lock().unwrap().clone()
    }

    fn row_from_record(record: &MonitorResultRecord, id: i64) -> MonitorResultRow {
        MonitorResultRow {
            id,
            monitor_id: record.monitor_id.0,
            location: record.location.to_string(),
            checked_at: record.checked_at,
            status: record.status.to_string(),
            is_up: record.is_up,
            response_time_ms: record.response_time_ms.map(|ms| ms as i64),
            details: serde_json::to_string(&record.details).unwrap_or_else(|_| "null".into()),
            execution_group_id: record
                .execution_group_id
                .as_ref()
                .map(|group| group.as_str().to_string()),
            consecutive_failure_count: record.consecutive_failure_count as i64,
            consecutive_success_count: record.consecutive_success_count as i64,
            alerts_sent_for_failure: record.alerts_sent_for_failure as i64,
            alerts_sent_for_recovery: record.alerts_sent_for_recovery as i64,
            is_status_change: record.is_status_change,
        }
    }
}

#[async_trait]
impl MonitorResultRepo for InMemoryMonitorResultRepo {
    async fn insert(&self, record: &MonitorResultRecord) -> Result<(), RepoError> {
        let mut rows = self.rows.lock().unwrap();
        let id = rows.len() as i64 + 1;
        rows.push(Self::row_from_record(record, id));
        Ok(())
    }

    async fn latest_for_location(
        &self,
        monitor_id: &MonitorId,
        location: LocationCode,
    ) -> Result<Option<MonitorResultRow>, RepoError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|row| {
                row.monitor_id == monitor_id.0 && row.location == location.to_string()
            })
            .max_by_key(|row| (row.checked_at, row.id))
            .cloned())
    }

    async fn latest_per_location_for_group(
        &self,
        monitor_id: &MonitorId,
        execution_group_id: &ExecutionGroupId,
    ) -> Result<Vec<MonitorResultRow>, RepoError> {
        let rows = self.rows.lock().unwrap();
        let mut latest: HashMap<String, MonitorResultRow> = HashMap::new();
        for row in rows.iter() {
            if row.monitor_id == monitor_id.0
                && row.execution_group_id.as_deref() == Some(execution_group_id.as_str())
            {
                latest.insert(row.location.clone(), row.clone());
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn increment_failure_alerts(
        &self,
        monitor_id: &MonitorId,
        location: LocationCode,
    ) -> Result<(), RepoError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows
            .iter_mut()
            .filter(|row| {
                row.monitor_id == monitor_id.0 && row.location == location.to_string()
            })
            .max_by_key(|row| row.id)
        {
            row.alerts_sent_for_failure += 1;
        }
        Ok(())
    }

    async fn increment_recovery_alerts(
        &self,
        monitor_id: &MonitorId,
        location: LocationCode,
    ) -> Result<(), RepoError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows
            .iter_mut()
            .filter(|row| {
                row.monitor_id == monitor_id.0 && row.location == location.to_string()
            })
            .max_by_key(|row| row.id)
        {
            row.alerts_sent_for_recovery += 1;
        }
        Ok(())
    }
}
