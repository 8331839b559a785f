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

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, Pool, Postgres, Sqlite};
use std::error::Error;
use tracing::info;
use vantage_common::config::{DbPostgresConfig, DbSqliteConfig};

fn pg_connect_options_from(config: &DbPostgresConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(config.host.as_str())
        .port(config.port)
        .database(config.database.as_str())
        .username(config.username.as_str())
        .password(config.password.reveal())
}

fn sqlite_connect_options_from(config: &DbSqliteConfig) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(std::path::Path::new(config.database.as_str()))
        .create_if_missing(true)
        .foreign_keys(config.foreign_keys)
}

pub async fn create_postgres_pool(
    config: &DbPostgresConfig,
) -> Result<Pool<Postgres>, Box<dyn Error>> {
    info!(
        "DB pool: postgresql://{}:{}/{}",
        config.host, config.port, config.database
    );
    let conn_options = pg_connect_options_from(config);
    let schema = config.schema.clone();

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .after_connect(move |conn, _meta| {
            let schema = schema.clone();
            Box::pin(async move {
                if let Some(schema) = schema {
                    let sql = format!("SET SCHEMA '{schema}';");
                    conn.execute(sqlx::query(&sql)).await?;
                }
                Ok(())
            })
        })
        .connect_with(conn_options)
        .await
        .map_err(|e| e.into())
}

pub async fn create_sqlite_pool(config: &DbSqliteConfig) -> Result<Pool<Sqlite>, Box<dyn Error>> {
    info!("DB pool: sqlite://{}", config.database);
    let conn_options = sqlite_connect_options_from(config);

    SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(conn_options)
        .await
        .map_err(|e| e.into())
}
