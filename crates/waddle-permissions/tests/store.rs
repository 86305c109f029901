//! Record store behaviour: persistence, caching, the section and invalidation.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use common::{branch, catalog, leaf, migrated_file_db, migrated_memory_db, CATALOG};
use waddle_permissions::permissions::{
    BroadcastTransport, LibSqlRecordStorage, PermissionError, PermissionRecord, PermissionService,
    PermissionStore, RecordStorage, UserId,
};

/// Wraps real storage, counting fetches and optionally holding them until
/// released.
struct GatedStorage {
    inner: LibSqlRecordStorage,
    fetches: AtomicUsize,
    gate: Option<Arc<Notify>>,
    fail_writes: bool,
}

impl GatedStorage {
    async fn new() -> Self {
        Self {
            inner: LibSqlRecordStorage::new(migrated_memory_db("gated").await),
            fetches: AtomicUsize::new(0),
            gate: None,
            fail_writes: false,
        }
    }
}

#[async_trait]
impl RecordStorage for GatedStorage {
    async fn fetch_records(&self, user_id: UserId) -> Result<Vec<PermissionRecord>, PermissionError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.inner.fetch_records(user_id).await
    }

    async fn insert_records(&self, records: &[PermissionRecord]) -> Result<u64, PermissionError> {
        if self.fail_writes {
            return Err(PermissionError::DatabaseError("disk full".to_string()));
        }
        self.inner.insert_records(records).await
    }

    async fn delete_records(&self, records: &[PermissionRecord]) -> Result<u64, PermissionError> {
        self.inner.delete_records(records).await
    }

    async fn delete_user(&self, user_id: UserId) -> Result<u64, PermissionError> {
        self.inner.delete_user(user_id).await
    }
}

#[tokio::test]
async fn test_concurrent_misses_fetch_once() {
    let storage = Arc::new(GatedStorage::new().await);
    let store = Arc::new(PermissionStore::new(storage.clone(), catalog(CATALOG)));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.snapshot(1, &CancellationToken::new()).await
        }));
    }
    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }

    assert_eq!(storage.fetches.load(Ordering::SeqCst), 1);
    assert!(store.is_cached(1));
}

#[tokio::test]
async fn test_cancelled_refresh_publishes_nothing() {
    let gate = Arc::new(Notify::new());
    let mut storage = GatedStorage::new().await;
    storage.gate = Some(Arc::clone(&gate));
    let storage = Arc::new(storage);
    let store = Arc::new(PermissionStore::new(storage.clone(), catalog(CATALOG)));

    let cancel = CancellationToken::new();
    let pending = {
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        tokio::spawn(async move { store.get_permissions(2, &cancel).await })
    };

    // Wait until the fetch is parked on the gate, then cancel it
    while storage.fetches.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    cancel.cancel();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(PermissionError::Cancelled)));
    assert!(!store.is_cached(2));

    // The section was released: a fresh read goes through
    gate.notify_one();
    assert_ok!(store.get_permissions(2, &CancellationToken::new()).await);
    assert!(store.is_cached(2));
}

#[tokio::test]
async fn test_failed_write_propagates_and_keeps_cache() {
    let mut storage = GatedStorage::new().await;
    storage.fail_writes = true;
    let store = PermissionStore::new(Arc::new(storage), catalog(CATALOG));
    let cancel = CancellationToken::new();

    store.snapshot(3, &cancel).await.unwrap();
    let error = assert_err!(store.add_permission(3, branch("app::x")).await);
    assert!(matches!(error, PermissionError::DatabaseError(_)));

    // Nothing was persisted, so nothing was invalidated
    assert!(store.is_cached(3));
    assert!(store.get_permissions(3, &cancel).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("perms.db");
    let cancel = CancellationToken::new();

    {
        let service =
            PermissionService::with_database(migrated_file_db("first", &path).await, catalog(CATALOG));
        service.add_permissions(4, &[branch("-app::chat.*")]).await.unwrap();
        service.add_groups(4, &["helper"]).await.unwrap();
    }

    let service =
        PermissionService::with_database(migrated_file_db("second", &path).await, catalog(CATALOG));
    assert!(!service.has_permission(4, &leaf("app::chat.send"), &cancel).await.unwrap());
    assert!(service.has_permission(4, &leaf("app::help.faq"), &cancel).await.unwrap());
}

#[tokio::test]
async fn test_bulk_operations_count_changes() {
    let service = PermissionService::with_database(migrated_memory_db("bulk").await, catalog(CATALOG));

    let added = service
        .add_permissions(5, &[branch("app::a"), branch("app::b"), branch("app::a")])
        .await
        .unwrap();
    assert_eq!(added, 2);

    let added = service.add_groups(5, &["helper", "moderator", "Helper"]).await.unwrap();
    assert_eq!(added, 2);

    let removed = service
        .remove_permissions(5, &[branch("app::b"), branch("app::missing")])
        .await
        .unwrap();
    assert_eq!(removed, 1);

    assert_eq!(service.clear_user(5).await.unwrap(), 3);
    assert_eq!(service.remove_groups(5, &["helper"]).await.unwrap(), 0);
}

#[tokio::test]
async fn test_remove_matches_rows_written_in_any_form() {
    let db = migrated_memory_db("legacy-rows").await;
    {
        let conn = db.acquire().await.unwrap();
        conn.execute(
            "INSERT INTO permission_records (user_id, is_group, payload) VALUES (7, 0, '+APP::x'), (7, 1, ' Helper ')",
            (),
        )
        .await
        .unwrap();
    }
    let service = PermissionService::with_database(db, catalog(CATALOG));
    let cancel = CancellationToken::new();

    assert!(service.has_permission(7, &leaf("app::x"), &cancel).await.unwrap());
    assert!(service.has_permission(7, &leaf("app::help.faq"), &cancel).await.unwrap());

    assert_eq!(service.remove_permissions(7, &[branch("app::x")]).await.unwrap(), 1);
    assert_eq!(service.remove_groups(7, &["helper"]).await.unwrap(), 1);

    let snapshot = service.store.snapshot(7, &cancel).await.unwrap();
    assert!(snapshot.branches.is_empty());
    assert!(snapshot.groups.is_empty());
    assert!(!service.has_permission(7, &leaf("app::x"), &cancel).await.unwrap());
}

#[tokio::test]
async fn test_remote_invalidation_reaches_other_process() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let transport = Arc::new(BroadcastTransport::new(16));
    let cancel = CancellationToken::new();

    let writer = PermissionService::with_database(migrated_file_db("writer", &path).await, catalog(CATALOG))
        .with_transport(transport.clone());
    let reader = PermissionService::with_database(migrated_file_db("reader", &path).await, catalog(CATALOG))
        .with_transport(transport.clone());
    let listener = reader.listen(cancel.clone()).unwrap();

    assert!(!reader.has_permission(6, &leaf("app::help.faq"), &cancel).await.unwrap());
    assert!(reader.store.is_cached(6));

    writer.add_groups(6, &["helper"]).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while reader.store.is_cached(6) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(reader.has_permission(6, &leaf("app::help.faq"), &cancel).await.unwrap());

    cancel.cancel();
    listener.await.unwrap();
}
