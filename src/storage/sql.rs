//! Relational record store (SQLite via sqlx)
//!
//! One minimal `{id TEXT PRIMARY KEY, data TEXT}` table per aggregate
//! scope; the `data` column carries the same JSON the other backends store.
//! Concurrent writers serialize on the database transaction.

use crate::error::{BrokerError, Result};
use crate::storage::{RecordStore, StorageRegistry, AGGREGATE_SCOPES};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

pub struct SqlRecordStore {
    pool: SqlitePool,
}

impl SqlRecordStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| storage_err("invalid sqlite url", e))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| storage_err("failed to open sqlite database", e))?;
        let store = Self { pool };
        for scope in AGGREGATE_SCOPES {
            store.ensure_table(scope).await?;
        }
        Ok(store)
    }

    /// Scope names come from a fixed set; reject anything else rather than
    /// interpolating arbitrary identifiers into SQL.
    fn table_name(scope: &str) -> Result<&str> {
        if AGGREGATE_SCOPES.contains(&scope) {
            Ok(scope)
        } else {
            Err(BrokerError::storage(format!("unknown aggregate scope '{scope}'")))
        }
    }

    async fn ensure_table(&self, scope: &str) -> Result<()> {
        let table = Self::table_name(scope)?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (id TEXT PRIMARY KEY, data TEXT NOT NULL)"
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| storage_err("failed to create table", e))?;
        Ok(())
    }
}

fn storage_err(message: &str, e: sqlx::Error) -> BrokerError {
    let transient = matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_));
    BrokerError::Storage {
        message: message.to_string(),
        transient,
        source: Some(Box::new(e)),
    }
}

#[async_trait]
impl RecordStore for SqlRecordStore {
    async fn put(&self, scope: &str, id: &str, record: Value) -> Result<()> {
        let table = Self::table_name(scope)?;
        sqlx::query(&format!(
            "INSERT INTO {table} (id, data) VALUES (?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET data = excluded.data"
        ))
        .bind(id)
        .bind(record.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| storage_err("failed to upsert record", e))?;
        Ok(())
    }

    async fn get(&self, scope: &str, id: &str) -> Result<Option<Value>> {
        let table = Self::table_name(scope)?;
        let row = sqlx::query(&format!("SELECT data FROM {table} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_err("failed to read record", e))?;
        row.map(|r| {
            let data: String = r.get("data");
            serde_json::from_str(&data).map_err(BrokerError::from)
        })
        .transpose()
    }

    async fn all(&self, scope: &str) -> Result<Vec<Value>> {
        let table = Self::table_name(scope)?;
        let rows = sqlx::query(&format!("SELECT data FROM {table} ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_err("failed to list records", e))?;
        rows.into_iter()
            .map(|r| {
                let data: String = r.get("data");
                serde_json::from_str(&data).map_err(BrokerError::from)
            })
            .collect()
    }

    async fn delete(&self, scope: &str, id: &str) -> Result<bool> {
        let table = Self::table_name(scope)?;
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE id = ?1"))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_err("failed to delete record", e))?;
        Ok(result.rows_affected() > 0)
    }
}

pub async fn register_sql_storage(registry: &StorageRegistry) -> Result<()> {
    registry
        .register(
            "sql",
            AGGREGATE_SCOPES.to_vec(),
            Box::new(|config| {
                Box::pin(async move {
                    Ok(std::sync::Arc::new(SqlRecordStore::connect(&config.sqlite_url).await?)
                        as _)
                })
            }),
        )
        .await;
    Ok(())
}
