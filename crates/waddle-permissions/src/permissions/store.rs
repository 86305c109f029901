//! Permission record store
//!
//! Owns the per-user caches and the single section that serialises every
//! mutation and every cache refresh. Reads that hit the cache never touch the
//! section; resolution then runs over the returned `Arc` snapshots without any
//! lock at all.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::branch::PermissionBranch;
use super::group::{normalize_group_id, CatalogSnapshot, GroupCatalog, PermissionGroup, ReloadSummary};
use super::record::{PermissionRecord, RecordPayload, UserId};
use super::storage::RecordStorage;
use super::PermissionError;

/// Immutable view of one user's assignments, as resolution consumes them.
#[derive(Debug, Clone)]
pub struct UserSnapshot {
    /// Individual branches in insertion order.
    pub branches: Arc<[PermissionBranch]>,
    /// Explicit non-default groups, descending priority.
    pub groups: Arc<[Arc<PermissionGroup>]>,
}

/// Cache entry of one user. Both lists live in one entry so a reader never
/// pairs branches from one refresh with groups from another. `groups` is
/// dropped on catalog reload while `branches` stays.
#[derive(Debug, Clone)]
struct CachedUser {
    branches: Arc<[PermissionBranch]>,
    groups: Option<Arc<[Arc<PermissionGroup>]>>,
}

/// Persisted per-user assignments plus their resolution caches.
pub struct PermissionStore {
    storage: Arc<dyn RecordStorage>,
    catalog: Arc<GroupCatalog>,
    section: Mutex<()>,
    cache: DashMap<UserId, CachedUser>,
}

impl PermissionStore {
    pub fn new(storage: Arc<dyn RecordStorage>, catalog: Arc<GroupCatalog>) -> Self {
        Self {
            storage,
            catalog,
            section: Mutex::new(()),
            cache: DashMap::new(),
        }
    }

    pub fn catalog(&self) -> &Arc<GroupCatalog> {
        &self.catalog
    }

    async fn enter(&self) -> MutexGuard<'_, ()> {
        self.section.lock().await
    }

    fn invalidate(&self, user_id: UserId) {
        self.cache.remove(&user_id);
    }

    // ---- mutations ----

    /// Grant or revoke a single branch. Returns false if the user already
    /// holds exactly this record.
    pub async fn add_permission(
        &self,
        user_id: UserId,
        branch: PermissionBranch,
    ) -> Result<bool, PermissionError> {
        Ok(self.add_permissions(user_id, &[branch]).await? > 0)
    }

    /// Store several branches for a user. Branches the user already holds
    /// (and repeats within `branches`) are skipped; the rest are written in
    /// one transaction. Returns how many records were added.
    #[instrument(skip(self, branches), fields(count = branches.len()))]
    pub async fn add_permissions(
        &self,
        user_id: UserId,
        branches: &[PermissionBranch],
    ) -> Result<usize, PermissionError> {
        if let Some(invalid) = branches.iter().find(|b| !b.is_valid()) {
            return Err(PermissionError::InvalidPath(invalid.to_string()));
        }

        let _section = self.enter().await;
        let existing = self.storage.fetch_records(user_id).await?;

        let mut seen: HashSet<PermissionBranch> = existing
            .into_iter()
            .filter_map(|record| match record.payload {
                RecordPayload::Individual(branch) => Some(branch),
                RecordPayload::Group(_) => None,
            })
            .collect();

        let fresh: Vec<PermissionRecord> = branches
            .iter()
            .filter(|branch| seen.insert((*branch).clone()))
            .map(|branch| PermissionRecord::individual(user_id, branch.clone()))
            .collect();

        let added = self.storage.insert_records(&fresh).await? as usize;
        self.invalidate(user_id);

        debug!(added, "Added permissions");
        Ok(added)
    }

    /// Remove a single branch record. Returns false if the user did not hold it.
    pub async fn remove_permission(
        &self,
        user_id: UserId,
        branch: &PermissionBranch,
    ) -> Result<bool, PermissionError> {
        Ok(self.remove_permissions(user_id, std::slice::from_ref(branch)).await? > 0)
    }

    /// Remove several branch records. The sign is part of the record, so
    /// removing `app::x` leaves a stored `-app::x` alone. Returns how many
    /// records were removed.
    #[instrument(skip(self, branches), fields(count = branches.len()))]
    pub async fn remove_permissions(
        &self,
        user_id: UserId,
        branches: &[PermissionBranch],
    ) -> Result<usize, PermissionError> {
        let _section = self.enter().await;
        let existing = self.storage.fetch_records(user_id).await?;

        // Fetched records carry their row, so stored text in any form matches.
        let doomed: Vec<PermissionRecord> = existing
            .into_iter()
            .filter(|record| match &record.payload {
                RecordPayload::Individual(stored) => branches.contains(stored),
                RecordPayload::Group(_) => false,
            })
            .collect();

        let removed = self.storage.delete_records(&doomed).await? as usize;
        self.invalidate(user_id);

        debug!(removed, "Removed permissions");
        Ok(removed)
    }

    /// Add a single group membership.
    pub async fn add_group(&self, user_id: UserId, group_id: &str) -> Result<bool, PermissionError> {
        Ok(self.add_groups(user_id, &[group_id]).await? > 0)
    }

    /// Store group memberships. Ids are normalised before comparison.
    /// Memberships in the default group or in groups the catalog does not
    /// know are stored but have no effect on resolution.
    #[instrument(skip(self, group_ids), fields(count = group_ids.len()))]
    pub async fn add_groups(
        &self,
        user_id: UserId,
        group_ids: &[&str],
    ) -> Result<usize, PermissionError> {
        let normalized = normalize_ids(group_ids)?;

        let _section = self.enter().await;
        let existing = self.storage.fetch_records(user_id).await?;

        let mut seen: HashSet<String> = existing
            .into_iter()
            .filter_map(|record| match record.payload {
                RecordPayload::Group(id) => Some(id),
                RecordPayload::Individual(_) => None,
            })
            .collect();

        let fresh: Vec<PermissionRecord> = normalized
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .map(|id| PermissionRecord::new(user_id, RecordPayload::Group(id)))
            .collect();

        for record in &fresh {
            if let RecordPayload::Group(id) = &record.payload {
                if self.catalog.is_default_id(id) || self.catalog.get(id).is_none() {
                    debug!(group = %id, "Stored membership has no resolution effect");
                }
            }
        }

        let added = self.storage.insert_records(&fresh).await? as usize;
        self.invalidate(user_id);

        debug!(added, "Added groups");
        Ok(added)
    }

    /// Remove a single group membership.
    pub async fn remove_group(&self, user_id: UserId, group_id: &str) -> Result<bool, PermissionError> {
        Ok(self.remove_groups(user_id, &[group_id]).await? > 0)
    }

    /// Remove group memberships. Returns how many records were removed.
    #[instrument(skip(self, group_ids), fields(count = group_ids.len()))]
    pub async fn remove_groups(
        &self,
        user_id: UserId,
        group_ids: &[&str],
    ) -> Result<usize, PermissionError> {
        let wanted: HashSet<String> = normalize_ids(group_ids)?.into_iter().collect();

        let _section = self.enter().await;
        let existing = self.storage.fetch_records(user_id).await?;

        let doomed: Vec<PermissionRecord> = existing
            .into_iter()
            .filter(|record| match &record.payload {
                RecordPayload::Group(id) => wanted.contains(id),
                RecordPayload::Individual(_) => false,
            })
            .collect();

        let removed = self.storage.delete_records(&doomed).await? as usize;
        self.invalidate(user_id);

        debug!(removed, "Removed groups");
        Ok(removed)
    }

    /// Delete every record of a user.
    #[instrument(skip(self))]
    pub async fn clear_user(&self, user_id: UserId) -> Result<usize, PermissionError> {
        let _section = self.enter().await;
        let removed = self.storage.delete_user(user_id).await?;
        self.invalidate(user_id);

        info!(removed, "Cleared user records");
        Ok(removed as usize)
    }

    // ---- reads ----

    /// Individual branches of a user, insertion order.
    pub async fn get_permissions(
        &self,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<Arc<[PermissionBranch]>, PermissionError> {
        if let Some(cached) = self.cache.get(&user_id) {
            debug!(user_id, "Permission cache hit");
            return Ok(Arc::clone(&cached.branches));
        }
        Ok(self.refresh(user_id, cancel).await?.branches)
    }

    /// Explicit non-default groups of a user, descending priority.
    pub async fn get_groups(
        &self,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<Arc<[Arc<PermissionGroup>]>, PermissionError> {
        if let Some(groups) = self.cache.get(&user_id).and_then(|c| c.groups.clone()) {
            debug!(user_id, "Group cache hit");
            return Ok(groups);
        }
        Ok(self.refresh(user_id, cancel).await?.groups)
    }

    /// Both lists of a user.
    pub async fn snapshot(
        &self,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<UserSnapshot, PermissionError> {
        if let Some(snapshot) = self.cached(user_id) {
            debug!(user_id, "User cache hit");
            return Ok(snapshot);
        }
        self.refresh(user_id, cancel).await
    }

    fn cached(&self, user_id: UserId) -> Option<UserSnapshot> {
        let cached = self.cache.get(&user_id)?;
        Some(UserSnapshot {
            branches: Arc::clone(&cached.branches),
            groups: Arc::clone(cached.groups.as_ref()?),
        })
    }

    /// Whether both lists of a user are cached.
    pub fn is_cached(&self, user_id: UserId) -> bool {
        self.cache
            .get(&user_id)
            .is_some_and(|cached| cached.groups.is_some())
    }

    /// Fetch a user's records under the section and publish both lists.
    ///
    /// Cancellation before the fetch completes returns
    /// [`PermissionError::Cancelled`] and leaves the caches untouched.
    #[instrument(skip(self, cancel))]
    async fn refresh(
        &self,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<UserSnapshot, PermissionError> {
        let _section = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PermissionError::Cancelled),
            guard = self.enter() => guard,
        };

        // Another task may have refreshed while we waited.
        if let Some(snapshot) = self.cached(user_id) {
            return Ok(snapshot);
        }

        let records = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PermissionError::Cancelled),
            records = self.storage.fetch_records(user_id) => records?,
        };

        let mut branches = Vec::new();
        let mut group_ids = Vec::new();
        for record in records {
            match record.payload {
                RecordPayload::Individual(branch) => branches.push(branch),
                RecordPayload::Group(id) => group_ids.push(id),
            }
        }

        let snapshot = UserSnapshot {
            branches: branches.into(),
            groups: self
                .catalog
                .resolve_memberships(group_ids.iter().map(String::as_str))
                .into(),
        };

        self.cache.insert(
            user_id,
            CachedUser {
                branches: Arc::clone(&snapshot.branches),
                groups: Some(Arc::clone(&snapshot.groups)),
            },
        );

        debug!(
            branches = snapshot.branches.len(),
            groups = snapshot.groups.len(),
            "Cached user permissions"
        );
        Ok(snapshot)
    }

    // ---- invalidation ----

    /// Drop the cached lists of one user, or of everyone when `user_id` is 0.
    ///
    /// Waits for the section so an in-flight refresh cannot republish data
    /// fetched before the change that triggered this call.
    #[instrument(skip(self))]
    pub async fn clear_cached_permissions(&self, user_id: UserId) {
        let _section = self.enter().await;
        if user_id == 0 {
            self.cache.clear();
            info!("Cleared all cached permissions");
        } else {
            self.invalidate(user_id);
            debug!("Cleared cached permissions");
        }
    }

    /// Swap in a new group catalog and drop every cached group list.
    ///
    /// Individual branch caches survive: catalog content does not change
    /// which records a user has.
    pub async fn reload_catalog(
        &self,
        snapshot: &CatalogSnapshot,
    ) -> Result<ReloadSummary, PermissionError> {
        let _section = self.enter().await;
        let summary = self.catalog.reload(snapshot)?;
        for mut cached in self.cache.iter_mut() {
            cached.groups = None;
        }
        Ok(summary)
    }
}

fn normalize_ids(group_ids: &[&str]) -> Result<Vec<String>, PermissionError> {
    group_ids
        .iter()
        .map(|raw| {
            let id = normalize_group_id(raw);
            if id.is_empty() {
                Err(PermissionError::InvalidGroup(
                    "Group id cannot be empty".to_string(),
                ))
            } else {
                Ok(id)
            }
        })
        .collect()
}
