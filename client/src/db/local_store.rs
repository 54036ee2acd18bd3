//! Per-table document storage.
//!
//! Each table holds `(id TEXT PRIMARY KEY, data TEXT)` rows where `data` is the
//! serialized record. Every operation on one store runs as its own
//! transaction, and transactions on one store never overlap: the next one
//! starts only after the previous one committed or rolled back.

use super::Pool;
use crate::error::{SyncError, SyncResult};
use ebb_engine::record::{merge_patch, require_id, set_record_id};
use ebb_engine::{Method, RecordId};
use serde_json::Value;
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Upper bound on ids bound into a single `IN (...)` clause.
const MAX_IN_IDS: usize = 500;

/// Document storage for one table.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: Pool,
    table: String,
    id_attribute: String,
    chain: Arc<Mutex<()>>,
}

impl LocalStore {
    /// Open a store over `table`, creating the table if needed.
    pub async fn open(
        pool: Pool,
        table: impl Into<String>,
        id_attribute: impl Into<String>,
    ) -> SyncResult<Self> {
        let store = Self {
            pool,
            table: table.into(),
            id_attribute: id_attribute.into(),
            chain: Arc::new(Mutex::new(())),
        };
        store.create_table().await?;
        Ok(store)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id_attribute(&self) -> &str {
        &self.id_attribute
    }

    fn quoted(&self) -> String {
        format!("\"{}\"", self.table.replace('"', "\"\""))
    }

    pub async fn create_table(&self) -> SyncResult<()> {
        let _turn = self.chain.lock().await;
        let statement = format!(
            "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY, data TEXT)",
            self.quoted()
        );
        sqlx::query(&statement)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::storage(&statement, e))?;
        Ok(())
    }

    pub async fn drop_table(&self) -> SyncResult<()> {
        let _turn = self.chain.lock().await;
        let statement = format!("DROP TABLE IF EXISTS {}", self.quoted());
        sqlx::query(&statement)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::storage(&statement, e))?;
        tracing::debug!(table = %self.table, "Dropped local table");
        Ok(())
    }

    /// Dispatch a sync method.
    ///
    /// `create`/`update` store the record (or array of records), `patch`
    /// merges into the stored record, `delete` removes by id and `read`
    /// returns the addressed record, or every record when `data` has no id.
    pub async fn sync(&self, method: Method, data: &Value) -> SyncResult<Vec<Value>> {
        match method {
            Method::Create | Method::Update => {
                let records = match data {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                self.put(&records).await?;
                Ok(records)
            }
            Method::Patch => {
                let id = require_id(data, &self.id_attribute)?;
                Ok(vec![self.patch(&id, data).await?])
            }
            Method::Delete => {
                let id = require_id(data, &self.id_attribute)?;
                self.delete(&[id]).await?;
                Ok(Vec::new())
            }
            Method::Read => match ebb_engine::record::record_id(data, &self.id_attribute) {
                Some(id) => self.read(Some(&[id])).await,
                None => self.read(None).await,
            },
        }
    }

    /// Insert or replace records.
    pub async fn put(&self, records: &[Value]) -> SyncResult<()> {
        let _turn = self.chain.lock().await;
        let statement = format!(
            "INSERT OR REPLACE INTO {} (id, data) VALUES (?, ?)",
            self.quoted()
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::storage("BEGIN", e))?;
        for record in records {
            let id = require_id(record, &self.id_attribute)?;
            sqlx::query(&statement)
                .bind(id)
                .bind(serde_json::to_string(record)?)
                .execute(&mut *tx)
                .await
                .map_err(|e| SyncError::storage(&statement, e))?;
        }
        tx.commit()
            .await
            .map_err(|e| SyncError::storage("COMMIT", e))?;
        Ok(())
    }

    /// Merge `changes` into the stored record and return the result.
    ///
    /// A record that does not exist yet is created from the changes.
    pub async fn patch(&self, id: &str, changes: &Value) -> SyncResult<Value> {
        let _turn = self.chain.lock().await;
        let select = format!("SELECT data FROM {} WHERE id = ?", self.quoted());
        let upsert = format!(
            "INSERT OR REPLACE INTO {} (id, data) VALUES (?, ?)",
            self.quoted()
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::storage("BEGIN", e))?;

        let existing: Option<Option<String>> = sqlx::query_scalar(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| SyncError::storage(&select, e))?;

        let mut record = match existing.flatten() {
            Some(text) => serde_json::from_str(&text)?,
            None => Value::Object(serde_json::Map::new()),
        };
        merge_patch(&mut record, changes);
        set_record_id(&mut record, &self.id_attribute, id);

        sqlx::query(&upsert)
            .bind(id)
            .bind(serde_json::to_string(&record)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| SyncError::storage(&upsert, e))?;
        tx.commit()
            .await
            .map_err(|e| SyncError::storage("COMMIT", e))?;
        Ok(record)
    }

    /// Delete records by id. Missing ids are ignored.
    pub async fn delete(&self, ids: &[RecordId]) -> SyncResult<()> {
        let _turn = self.chain.lock().await;
        let statement = format!("DELETE FROM {} WHERE id = ?", self.quoted());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::storage("BEGIN", e))?;
        for id in ids {
            sqlx::query(&statement)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| SyncError::storage(&statement, e))?;
        }
        tx.commit()
            .await
            .map_err(|e| SyncError::storage("COMMIT", e))?;
        Ok(())
    }

    /// Read records, optionally restricted to the given ids.
    ///
    /// Results come back in insertion order; filtering and sorting beyond the
    /// id restriction is left to the caller.
    pub async fn read(&self, ids: Option<&[RecordId]>) -> SyncResult<Vec<Value>> {
        let _turn = self.chain.lock().await;
        let rows = match ids {
            None => {
                let statement = format!("SELECT id, data FROM {} ORDER BY rowid", self.quoted());
                sqlx::query(&statement)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| SyncError::storage(&statement, e))?
            }
            Some(ids) => {
                let mut rows = Vec::with_capacity(ids.len());
                for chunk in ids.chunks(MAX_IN_IDS) {
                    let placeholders = vec!["?"; chunk.len()].join(", ");
                    let statement = format!(
                        "SELECT id, data FROM {} WHERE id IN ({}) ORDER BY rowid",
                        self.quoted(),
                        placeholders
                    );
                    let mut query = sqlx::query(&statement);
                    for id in chunk {
                        query = query.bind(id);
                    }
                    rows.extend(
                        query
                            .fetch_all(&self.pool)
                            .await
                            .map_err(|e| SyncError::storage(&statement, e))?,
                    );
                }
                rows
            }
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let data: Option<String> = row
                .try_get("data")
                .map_err(|e| SyncError::storage("SELECT data", e))?;
            if let Some(data) = data {
                records.push(serde_json::from_str(&data)?);
            }
        }
        Ok(records)
    }

    /// Read one record.
    pub async fn get(&self, id: &str) -> SyncResult<Option<Value>> {
        let mut records = self.read(Some(&[id.to_string()])).await?;
        Ok(records.pop())
    }

    /// Delete every record.
    pub async fn clear(&self) -> SyncResult<()> {
        let _turn = self.chain.lock().await;
        let statement = format!("DELETE FROM {}", self.quoted());
        sqlx::query(&statement)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::storage(&statement, e))?;
        Ok(())
    }

    /// Replace the whole table content in one transaction.
    pub async fn replace_all(&self, records: &[Value]) -> SyncResult<()> {
        let _turn = self.chain.lock().await;
        let clear = format!("DELETE FROM {}", self.quoted());
        let insert = format!(
            "INSERT OR REPLACE INTO {} (id, data) VALUES (?, ?)",
            self.quoted()
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::storage("BEGIN", e))?;
        sqlx::query(&clear)
            .execute(&mut *tx)
            .await
            .map_err(|e| SyncError::storage(&clear, e))?;
        for record in records {
            let id = require_id(record, &self.id_attribute)?;
            sqlx::query(&insert)
                .bind(id)
                .bind(serde_json::to_string(record)?)
                .execute(&mut *tx)
                .await
                .map_err(|e| SyncError::storage(&insert, e))?;
        }
        tx.commit()
            .await
            .map_err(|e| SyncError::storage("COMMIT", e))?;
        Ok(())
    }

    /// Number of stored records.
    pub async fn count(&self) -> SyncResult<usize> {
        let _turn = self.chain.lock().await;
        let statement = format!("SELECT COUNT(*) FROM {}", self.quoted());
        let count: i64 = sqlx::query_scalar(&statement)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::storage(&statement, e))?;
        Ok(count as usize)
    }
}
