//! Record storage trait and libSQL implementation.
//!
//! The storage layer only persists rows. Uniqueness checks, locking and
//! caching live in [`super::store::PermissionStore`].

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::record::{PermissionRecord, RecordPayload, UserId};
use super::PermissionError;
use crate::db::Database;

/// Trait for permission record storage backends.
#[async_trait]
pub trait RecordStorage: Send + Sync {
    /// All records of a user, in insertion order.
    async fn fetch_records(&self, user_id: UserId) -> Result<Vec<PermissionRecord>, PermissionError>;

    /// Insert records atomically. Returns the number of rows written.
    ///
    /// Fails with [`PermissionError::RecordAlreadyExists`] if any record's
    /// `(user_id, is_group, payload)` key is already stored.
    async fn insert_records(&self, records: &[PermissionRecord]) -> Result<u64, PermissionError>;

    /// Delete records atomically. Returns the number of rows removed.
    ///
    /// Records read back from storage are deleted by their row; others by
    /// their `(user_id, is_group, payload)` key.
    async fn delete_records(&self, records: &[PermissionRecord]) -> Result<u64, PermissionError>;

    /// Delete every record of a user. Returns the number of rows removed.
    async fn delete_user(&self, user_id: UserId) -> Result<u64, PermissionError>;
}

/// SQLite stores signed integers; user ids round-trip through a bit cast.
fn to_sql_id(user_id: UserId) -> i64 {
    user_id as i64
}

fn from_sql_id(raw: i64) -> UserId {
    raw as UserId
}

fn db_err(e: libsql::Error) -> PermissionError {
    PermissionError::DatabaseError(e.to_string())
}

/// libSQL-backed record storage over the `permission_records` table.
#[derive(Clone)]
pub struct LibSqlRecordStorage {
    db: Database,
}

impl LibSqlRecordStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RecordStorage for LibSqlRecordStorage {
    #[instrument(skip(self))]
    async fn fetch_records(&self, user_id: UserId) -> Result<Vec<PermissionRecord>, PermissionError> {
        let conn = self.db.acquire().await?;

        let mut rows = conn
            .query(
                r#"
                SELECT id, user_id, is_group, payload FROM permission_records
                WHERE user_id = ?
                ORDER BY id
                "#,
                [to_sql_id(user_id)],
            )
            .await
            .map_err(db_err)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let row_id: i64 = row.get(0).map_err(db_err)?;
            let stored_user: i64 = row.get(1).map_err(db_err)?;
            let is_group: i64 = row.get(2).map_err(db_err)?;
            let payload: String = row.get(3).map_err(db_err)?;

            match RecordPayload::from_stored(is_group != 0, &payload) {
                Ok(payload) => {
                    records.push(PermissionRecord::stored(row_id, from_sql_id(stored_user), payload))
                }
                Err(e) => {
                    warn!(row_id, payload = %payload, error = %e, "Skipping unreadable permission record");
                }
            }
        }

        debug!(count = records.len(), "Fetched permission records");
        Ok(records)
    }

    #[instrument(skip_all, fields(count = records.len()))]
    async fn insert_records(&self, records: &[PermissionRecord]) -> Result<u64, PermissionError> {
        if records.is_empty() {
            return Ok(0);
        }

        let conn = self.db.acquire().await?;
        let tx = conn.transaction().await.map_err(db_err)?;

        let mut written = 0;
        for record in records {
            let result = tx
                .execute(
                    "INSERT INTO permission_records (user_id, is_group, payload) VALUES (?, ?, ?)",
                    (
                        to_sql_id(record.user_id),
                        record.is_group() as i64,
                        record.payload.to_payload_string(),
                    ),
                )
                .await;

            match result {
                Ok(rows) => written += rows,
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        warn!(error = %rollback, "Failed to roll back record insert");
                    }
                    return Err(if e.to_string().contains("UNIQUE constraint failed") {
                        PermissionError::RecordAlreadyExists
                    } else {
                        PermissionError::DatabaseError(e.to_string())
                    });
                }
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(written)
    }

    #[instrument(skip_all, fields(count = records.len()))]
    async fn delete_records(&self, records: &[PermissionRecord]) -> Result<u64, PermissionError> {
        if records.is_empty() {
            return Ok(0);
        }

        let conn = self.db.acquire().await?;
        let tx = conn.transaction().await.map_err(db_err)?;

        let mut removed = 0;
        for record in records {
            let result = match record.row_id {
                Some(row_id) => {
                    tx.execute(
                        "DELETE FROM permission_records WHERE id = ? AND user_id = ?",
                        (row_id, to_sql_id(record.user_id)),
                    )
                    .await
                }
                None => {
                    tx.execute(
                        "DELETE FROM permission_records WHERE user_id = ? AND is_group = ? AND payload = ?",
                        (
                            to_sql_id(record.user_id),
                            record.is_group() as i64,
                            record.payload.to_payload_string(),
                        ),
                    )
                    .await
                }
            };

            match result {
                Ok(rows) => removed += rows,
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        warn!(error = %rollback, "Failed to roll back record delete");
                    }
                    return Err(db_err(e));
                }
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(removed)
    }

    #[instrument(skip(self))]
    async fn delete_user(&self, user_id: UserId) -> Result<u64, PermissionError> {
        let conn = self.db.acquire().await?;
        conn.execute(
            "DELETE FROM permission_records WHERE user_id = ?",
            [to_sql_id(user_id)],
        )
        .await
        .map_err(db_err)
    }
}
