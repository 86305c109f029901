//! Database module for the permission engine
//!
//! Thin Turso/libSQL layer providing:
//! - In-memory and file-backed databases
//! - A persistent connection for in-memory databases (each new connection to
//!   `:memory:` would otherwise see an empty database)
//! - Embedded schema migrations

mod migrations;

use libsql::{Connection, Database as LibSqlDatabase};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument};

pub use migrations::{Migration, MigrationRunner};

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("Database query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Internal database error: {0}")]
    Internal(#[from] libsql::Error),
}

/// Wrapper around a libsql database
#[derive(Clone)]
pub struct Database {
    db: Arc<LibSqlDatabase>,
    name: String,
    /// Shared connection kept open for in-memory databases
    persistent: Option<Arc<Mutex<Connection>>>,
}

impl Database {
    /// Create a new in-memory database
    #[instrument(skip_all)]
    pub async fn in_memory(name: &str) -> Result<Self, DatabaseError> {
        debug!("Creating in-memory database: {}", name);
        let db = libsql::Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;

        Ok(Self {
            db: Arc::new(db),
            name: name.to_string(),
            persistent: Some(Arc::new(Mutex::new(conn))),
        })
    }

    /// Create or open a local file-based database
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open_local(name: &str, path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        debug!("Opening local database '{}' at: {:?}", name, path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionFailed(format!("Failed to create database directory: {}", e))
            })?;
        }

        let db = libsql::Builder::new_local(path).build().await?;

        info!("Opened database '{}' at {:?}", name, path);
        Ok(Self {
            db: Arc::new(db),
            name: name.to_string(),
            persistent: None,
        })
    }

    /// Open the configured database: a file when `path` is set, otherwise in-memory
    pub async fn open(name: &str, path: Option<&Path>) -> Result<Self, DatabaseError> {
        match path {
            Some(path) => Self::open_local(name, path).await,
            None => Self::in_memory(name).await,
        }
    }

    /// Get a new connection to the database
    pub fn connect(&self) -> Result<Connection, DatabaseError> {
        Ok(self.db.connect()?)
    }

    /// The persistent connection, present only for in-memory databases
    pub fn persistent_connection(&self) -> Option<Arc<Mutex<Connection>>> {
        self.persistent.clone()
    }

    /// Get the database name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the database is healthy by executing a simple query
    #[instrument(skip_all, fields(name = %self.name))]
    pub async fn health_check(&self) -> Result<bool, DatabaseError> {
        let conn = self.acquire().await?;
        match conn.query("SELECT 1", ()).await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!("Database health check failed: {}", e);
                Ok(false)
            }
        }
    }

    /// Acquire a connection: the persistent one for in-memory databases,
    /// a fresh one otherwise
    pub async fn acquire(&self) -> Result<DbConnection<'_>, DatabaseError> {
        match &self.persistent {
            Some(persistent) => Ok(DbConnection::Shared(persistent.lock().await)),
            None => Ok(DbConnection::Owned(self.connect()?)),
        }
    }
}

/// A connection borrowed from [`Database::acquire`]
pub enum DbConnection<'a> {
    Shared(MutexGuard<'a, Connection>),
    Owned(Connection),
}

impl std::ops::Deref for DbConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            DbConnection::Shared(guard) => &**guard,
            DbConnection::Owned(conn) => conn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::in_memory("test").await.unwrap();
        assert_eq!(db.name(), "test");
        assert!(db.persistent_connection().is_some());
    }

    #[tokio::test]
    async fn test_health_check() {
        let db = Database::in_memory("test").await.unwrap();
        let healthy = db.health_check().await.unwrap();
        assert!(healthy);
    }

    #[tokio::test]
    async fn test_in_memory_data_survives_across_acquire() {
        let db = Database::in_memory("test").await.unwrap();

        {
            let conn = db.acquire().await.unwrap();
            conn.execute("CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT)", ())
                .await
                .unwrap();
            conn.execute("INSERT INTO test (name) VALUES ('hello')", ())
                .await
                .unwrap();
        }

        let conn = db.acquire().await.unwrap();
        let mut rows = conn.query("SELECT name FROM test", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let name: String = row.get(0).unwrap();
        assert_eq!(name, "hello");
    }

    #[tokio::test]
    async fn test_open_local_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("perms.db");
        let db = Database::open("file", Some(path.as_path())).await.unwrap();
        assert!(db.persistent_connection().is_none());
        assert!(db.health_check().await.unwrap());
        assert!(path.parent().unwrap().exists());
    }
}
