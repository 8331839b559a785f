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
use vantage_common::model::{LocationCode, RunId, RunRecord, RunStatus};

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct RunRow {
    pub run_id: Uuid,
    pub job_id: Option<Uuid>,
    pub location: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub report_url: Option<String>,
    pub logs_url: Option<String>,
    pub error_details: Option<String>,
    pub metadata: String,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = String;

    fn try_from(value: RunRow) -> Result<Self, Self::Error> {
        Ok(RunRecord {
            run_id: RunId(value.run_id),
            job_id: value.job_id,
            location: LocationCode::from_str(&value.location)?,
            status: RunStatus::from_str(&value.status)?,
            started_at: value.started_at,
            completed_at: value.completed_at,
            duration_ms: value.duration_ms.map(|ms| ms.max(0) as u64),
            report_url: value.report_url,
            logs_url: value.logs_url,
            error_details: value.error_details,
            metadata: serde_json::from_str(&value.metadata)
                .map_err(|e| format!("Invalid run metadata: {e}"))?,
        })
    }
}

impl From<&RunRecord> for RunRow {
    fn from(value: &RunRecord) -> Self {
        RunRow {
            run_id: value.run_id.0,
            job_id: value.job_id,
            location: value.location.to_string(),
            status: value.status.to_string(),
            started_at: value.started_at,
            completed_at: value.completed_at,
            duration_ms: value.duration_ms.map(|ms| ms as i64),
            report_url: value.report_url.clone(),
            logs_url: value.logs_url.clone(),
            error_details: value.error_details.clone(),
            metadata: serde_json::to_string(&value.metadata).unwrap_or_else(|_| "null".into()),
        }
    }
}

#[async_trait]
pub trait RunRepo: Send + Sync {
    async fn create(&self, record: &RunRecord) -> Result<(), RepoError>;

    async fn update(&self, record: &RunRecord) -> Result<(), RepoError>;

    async fn get(&self, run_id: &RunId) -> Result<Option<RunRow>, RepoError>;
}

pub struct DbRunRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbRunRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

const INSERT_RUN: &str = r#"
  INSERT INTO runs
    (run_id, job_id, location, status, started_at, completed_at, duration_ms, report_url, logs_url, error_details, metadata)
  VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
"#;

const UPDATE_RUN: &str = r#"
  UPDATE runs
  SET status = $2,
      completed_at = $3,
      duration_ms = $4,
      report_url = $5,
      logs_url = $6,
      error_details = $7,
      metadata = $8
  WHERE run_id = $1
"#;

const SELECT_RUN: &str = r#"
  SELECT run_id, job_id, location, status, started_at, completed_at, duration_ms, report_url, logs_url, error_details, metadata
  FROM runs
  WHERE run_id = $1
"#;

#[async_trait]
impl RunRepo for DbRunRepo<sqlx::Postgres> {
    async fn create(&self, record: &RunRecord) -> Result<(), RepoError> {
        let row = RunRow::from(record);
        sqlx::query(INSERT_RUN)
            .bind(row.run_id)
            .bind(row.job_id)
            .bind(row.location)
            .bind(row.status)
            .bind(row.started_at)
            .bind(row.completed_at)
            .bind(row.duration_ms)
            .bind(row.report_url)
            .bind(row.logs_url)
            .bind(row.error_details)
            .bind(row.metadata)
            .execute(&*self.db_pool)
            .await?;
        Ok(())
    }

    async fn update(&self, record: &RunRecord) -> Result<(), RepoError> {
        let row = RunRow::from(record);
        sqlx::query(UPDATE_RUN)
            .bind(row.run_id)
            .bind(row.status)
            .bind(row.completed_at)
            .bind(row.duration_ms)
            .bind(row.report_url)
            .bind(row.logs_url)
            .bind(row.error_details)
            .bind(row.metadata)
            .execute(&*self.db_pool)
            .await?;
        Ok(())
    }

    async fn get(&self, run_id: &RunId) -> Result<Option<RunRow>, RepoError> {
        sqlx::query_as::<_, RunRow>(SELECT_RUN)
            .bind(run_id.0)
            .fetch_optional(&*self.db_pool)
            .await
            .map_err(|e| e.into())
    }
}

#[async_trait]
impl RunRepo for DbRunRepo<sqlx::Sqlite> {
    async fn create(&self, record: &RunRecord) -> Result<(), RepoError> {
        let row = RunRow::from(record);
        sqlx::query(INSERT_RUN)
            .bind(row.run_id)
            .bind(row.job_id)
            .bind(row.location)
            .bind(row.status)
            .bind(row.started_at)
            .bind(row.completed_at)
            .bind(row.duration_ms)
            .bind(row.report_url)
            .bind(row.logs_url)
            .bind(row.error_details)
            .bind(row.metadata)
            .execute(&*self.db_pool)
            .await?;
        Ok(())
    }

    async fn update(&self, record: &RunRecord) -> Result<(), RepoError> {
        let row = RunRow::from(record);
        sqlx::query(UPDATE_RUN)
            .bind(row.run_id)
            .bind(row.status)
            .bind(row.completed_at)
            .bind(row.duration_ms)
            .bind(row.report_url)
            .bind(row.logs_url)
            .bind(row.error_details)
            .bind(row.metadata)
            .execute(&*self.db_pool)
            .await?;
        Ok(())
    }

    async fn get(&self, run_id: &RunId) -> Result<Option<RunRow>, RepoError> {
        sqlx::query_as::<_, RunRow>(SELECT_RUN)
            .bind(run_id.0)
            .fetch_optional(&*self.db_pool)
            .await
            .map_err(|e| e.into())
    }
}

#[derive(Default)]
pub struct InMemoryRunRepo {
    records: Mutex<HashMap<Uuid, RunRecord>>,
}

impl InMemoryRunRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_record(&self, run_id: &RunId) -> Option<RunRecord> {
        self.records.lock().unwrap().get(&run_id.0).cloned()
    }
}

#[async_trait]
impl RunRepo for InMemoryRunRepo {
    async fn create(&self, record: &RunRecord) -> Result<(), RepoError> {
        self.records
            .lock()
            .unwrap()
            .insert(record.run_id.0, record.clone());
        Ok(())
    }

    async fn update(&self, record: &RunRecord) -> Result<(), RepoError> {
        self.records
            .lock()
            .unwrap()
            .insert(record.run_id.0, record.clone());
        Ok(())
    }

    async fn get(&self, run_id: &RunId) -> Result<Option<RunRow>, RepoError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&run_id.0)
            .map(|record| RunRow::from(record)))
    }
}
