//! Hierarchical wildcard permissions for Waddle
//!
//! Permissions are dotted paths inside a domain:
//!
//! - **Leaves** (`app::chat.send`) are what callers check for
//! - **Branches** (`app::chat.*`, `-core::admin`, `*`) are what users and
//!   groups hold; they may end in a wildcard and carry a sign
//! - **Groups** are named, prioritised bundles of branches; one of them may be
//!   the default group every user implicitly belongs to
//!
//! # Example
//!
//! ```ignore
//! // Moderators may do everything under moderation except ban. Within a
//! // list the earliest matching entry decides, so the revoke comes first.
//! [[groups]]
//! id = "moderator"
//! priority = 50
//! permissions = ["-app::moderation.ban", "app::moderation.*"]
//!
//! // One user additionally holds ban
//! service.add_permissions(42, &[PermissionBranch::parse("app::moderation.ban")?]).await?;
//! ```

mod branch;
mod codec;
mod group;
mod invalidation;
mod leaf;
mod path;
mod record;
mod resolver;
mod storage;
mod store;

pub use branch::PermissionBranch;
pub use codec::{
    decode_branch, decode_branches, decode_leaf, encode_branch, encode_branches, encode_leaf,
    MAX_PATH_LEN,
};
pub use group::{
    normalize_group_id, CatalogSnapshot, GroupCatalog, GroupDefinition, PermissionGroup,
    ReloadSummary,
};
pub use invalidation::{
    spawn_invalidation_listener, BroadcastTransport, CacheInvalidation, InvalidationSubscription,
    InvalidationTransport,
};
pub use leaf::PermissionLeaf;
pub use path::{Domain, Mode};
pub use record::{PermissionRecord, RecordPayload, UserId};
pub use resolver::{
    resolve, CheckRequest, CheckResponse, Decision, ListSource, PermissionResolver, ScanOutcome,
    ScanState,
};
pub use storage::{LibSqlRecordStorage, RecordStorage};
pub use store::{PermissionStore, UserSnapshot};

use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::db::Database;

/// Permission-specific errors
#[derive(Error, Debug)]
pub enum PermissionError {
    #[error("Invalid permission: {0}")]
    InvalidPath(String),

    #[error("Not an absolute permission: {0}")]
    NotAbsolute(String),

    #[error("Invalid group: {0}")]
    InvalidGroup(String),

    #[error("Group catalog error: {0}")]
    Catalog(String),

    #[error("Wire format error: {0}")]
    Codec(String),

    #[error("Record already exists")]
    RecordAlreadyExists,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Invalidation transport error: {0}")]
    Transport(String),
}

impl From<crate::db::DatabaseError> for PermissionError {
    fn from(err: crate::db::DatabaseError) -> Self {
        PermissionError::DatabaseError(err.to_string())
    }
}

/// Main permission service combining the record store, the resolver and the
/// optional invalidation transport
pub struct PermissionService {
    pub store: Arc<PermissionStore>,
    pub resolver: PermissionResolver,
    transport: Option<Arc<dyn InvalidationTransport>>,
}

impl PermissionService {
    /// Create a new permission service
    pub fn new(storage: Arc<dyn RecordStorage>, catalog: Arc<GroupCatalog>) -> Self {
        let store = Arc::new(PermissionStore::new(storage, catalog));
        let resolver = PermissionResolver::new(Arc::clone(&store));

        Self {
            store,
            resolver,
            transport: None,
        }
    }

    /// Create a service over the libSQL record table. Migrations must already
    /// have been applied.
    pub fn with_database(db: Database, catalog: Arc<GroupCatalog>) -> Self {
        Self::new(Arc::new(LibSqlRecordStorage::new(db)), catalog)
    }

    /// Publish an invalidation through `transport` after every mutation
    pub fn with_transport(mut self, transport: Arc<dyn InvalidationTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn catalog(&self) -> &Arc<GroupCatalog> {
        self.store.catalog()
    }

    /// Check if a user has a permission
    pub async fn check(
        &self,
        user_id: UserId,
        permission: &PermissionLeaf,
        caller_superuser: bool,
        cancel: &CancellationToken,
    ) -> Result<CheckResponse, PermissionError> {
        let mut request = CheckRequest::new(user_id, permission.clone());
        request.caller_superuser = caller_superuser;
        self.resolver.check(&request, cancel).await
    }

    pub async fn has_permission(
        &self,
        user_id: UserId,
        permission: &PermissionLeaf,
        cancel: &CancellationToken,
    ) -> Result<bool, PermissionError> {
        self.resolver
            .has_permission(user_id, permission, false, cancel)
            .await
    }

    /// Store branches for a user
    pub async fn add_permissions(
        &self,
        user_id: UserId,
        branches: &[PermissionBranch],
    ) -> Result<usize, PermissionError> {
        let added = self.store.add_permissions(user_id, branches).await?;
        self.publish(user_id).await;
        Ok(added)
    }

    /// Remove stored branches of a user
    pub async fn remove_permissions(
        &self,
        user_id: UserId,
        branches: &[PermissionBranch],
    ) -> Result<usize, PermissionError> {
        let removed = self.store.remove_permissions(user_id, branches).await?;
        self.publish(user_id).await;
        Ok(removed)
    }

    /// Add group memberships
    pub async fn add_groups(&self, user_id: UserId, group_ids: &[&str]) -> Result<usize, PermissionError> {
        let added = self.store.add_groups(user_id, group_ids).await?;
        self.publish(user_id).await;
        Ok(added)
    }

    /// Remove group memberships
    pub async fn remove_groups(
        &self,
        user_id: UserId,
        group_ids: &[&str],
    ) -> Result<usize, PermissionError> {
        let removed = self.store.remove_groups(user_id, group_ids).await?;
        self.publish(user_id).await;
        Ok(removed)
    }

    /// Remove every record of a user
    pub async fn clear_user(&self, user_id: UserId) -> Result<usize, PermissionError> {
        let removed = self.store.clear_user(user_id).await?;
        self.publish(user_id).await;
        Ok(removed)
    }

    /// Replace the group catalog. Not broadcast: every process reloads from
    /// its own catalog source.
    pub async fn reload_groups(
        &self,
        snapshot: &CatalogSnapshot,
    ) -> Result<ReloadSummary, PermissionError> {
        self.store.reload_catalog(snapshot).await
    }

    /// Clear cached permissions locally and on every subscribed process
    pub async fn clear_cached_permissions(&self, user_id: UserId) {
        self.store.clear_cached_permissions(user_id).await;
        self.publish(user_id).await;
    }

    /// Start applying invalidations from the configured transport
    pub fn listen(&self, cancel: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        let transport = self.transport.as_ref()?;
        Some(spawn_invalidation_listener(
            Arc::clone(&self.store),
            transport.subscribe(),
            cancel,
        ))
    }

    /// The change is already persisted; a failed broadcast only delays other
    /// processes until their next invalidation.
    async fn publish(&self, user_id: UserId) {
        if let Some(transport) = &self.transport {
            if let Err(e) = transport.publish(CacheInvalidation::user(user_id)).await {
                warn!(user_id, error = %e, "Failed to publish cache invalidation");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MigrationRunner;

    async fn setup_service() -> PermissionService {
        let db = Database::in_memory("test-permissions").await.unwrap();
        MigrationRunner::records().run(&db).await.unwrap();

        let snapshot = CatalogSnapshot::new(vec![
            GroupDefinition::new("default", 0)
                .with_permission("app::chat.*")
                .as_default(),
            GroupDefinition::new("moderator", 50)
                .with_permission("-app::moderation.ban")
                .with_permission("app::moderation.*"),
        ]);
        let catalog = Arc::new(GroupCatalog::from_snapshot(&snapshot).unwrap());
        PermissionService::with_database(db, catalog)
    }

    fn leaf(s: &str) -> PermissionLeaf {
        PermissionLeaf::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_permission_service_basic() {
        let service = setup_service().await;
        let cancel = CancellationToken::new();

        // Everyone gets the default group
        let response = service
            .check(1, &leaf("app::chat.send"), false, &cancel)
            .await
            .unwrap();
        assert!(response.allowed);
        assert_eq!(response.reason.as_deref(), Some("default-group:default"));

        // Nothing grants moderation yet
        let response = service
            .check(1, &leaf("app::moderation.kick"), false, &cancel)
            .await
            .unwrap();
        assert!(!response.allowed);
        assert_eq!(response.reason.as_deref(), Some("no-match"));

        service.add_groups(1, &["moderator"]).await.unwrap();
        assert!(service
            .has_permission(1, &leaf("app::moderation.kick"), &cancel)
            .await
            .unwrap());
        assert!(!service
            .has_permission(1, &leaf("app::moderation.ban"), &cancel)
            .await
            .unwrap());

        // An individual grant is consulted before any group
        service
            .add_permissions(1, &[PermissionBranch::parse("app::moderation.ban").unwrap()])
            .await
            .unwrap();
        let response = service
            .check(1, &leaf("app::moderation.ban"), false, &cancel)
            .await
            .unwrap();
        assert!(response.allowed);
        assert_eq!(response.reason.as_deref(), Some("individual"));
    }

    #[tokio::test]
    async fn test_caller_superuser_bypasses_everything() {
        let service = setup_service().await;
        let cancel = CancellationToken::new();
        service
            .add_permissions(2, &[PermissionBranch::parse("-*").unwrap()])
            .await
            .unwrap();

        let response = service
            .check(2, &leaf("core::shutdown"), true, &cancel)
            .await
            .unwrap();
        assert_eq!(response, CheckResponse::allowed("caller-superuser"));
    }

    #[tokio::test]
    async fn test_mutations_publish_invalidations() {
        let transport = Arc::new(BroadcastTransport::new(16));
        let mut subscription = transport.subscribe();
        let service = setup_service().await.with_transport(transport);

        service.add_groups(9, &["moderator"]).await.unwrap();
        service.clear_cached_permissions(0).await;

        assert_eq!(
            subscription.next().await.unwrap(),
            Some(CacheInvalidation::user(9))
        );
        assert_eq!(
            subscription.next().await.unwrap(),
            Some(CacheInvalidation::all())
        );
    }

    #[tokio::test]
    async fn test_reload_groups_changes_outcome() {
        let service = setup_service().await;
        let cancel = CancellationToken::new();
        service.add_groups(3, &["moderator"]).await.unwrap();
        assert!(service
            .has_permission(3, &leaf("app::moderation.kick"), &cancel)
            .await
            .unwrap());

        let next = CatalogSnapshot::new(vec![GroupDefinition::new("moderator", 50)
            .with_permission("-app::moderation.*")]);
        let summary = service.reload_groups(&next).await.unwrap();
        assert_eq!(summary.dropped, 1);

        let response = service
            .check(3, &leaf("app::moderation.kick"), false, &cancel)
            .await
            .unwrap();
        assert_eq!(response, CheckResponse::denied("group:moderator"));
    }
}
