//! Permission groups and the group catalog
//!
//! Groups are loaded wholesale from a snapshot (usually a TOML file). The
//! catalog keeps them sorted by descending priority, holds the default group
//! apart from the rest, and merges reloads into the existing group objects so
//! `Arc<PermissionGroup>` handles held elsewhere stay valid.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::branch::PermissionBranch;
use super::PermissionError;

/// Normalise a group id for storage and lookup.
pub fn normalize_group_id(id: &str) -> String {
    id.trim().to_lowercase()
}

/// One group as it appears in a catalog snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDefinition {
    pub id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub default: bool,
}

impl GroupDefinition {
    pub fn new(id: impl Into<String>, priority: i32) -> Self {
        Self {
            id: id.into(),
            priority,
            permissions: Vec::new(),
            default: false,
        }
    }

    pub fn with_permission(mut self, permission: &str) -> Self {
        self.permissions.push(permission.to_string());
        self
    }

    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }
}

/// Ordered list of group definitions, in config order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub groups: Vec<GroupDefinition>,
}

impl CatalogSnapshot {
    pub fn new(groups: Vec<GroupDefinition>) -> Self {
        Self { groups }
    }

    /// Parse a TOML document with `[[groups]]` tables.
    pub fn from_toml(content: &str) -> Result<Self, PermissionError> {
        toml::from_str(content)
            .map_err(|e| PermissionError::Catalog(format!("Invalid group catalog: {}", e)))
    }

    /// Read and parse a TOML catalog file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PermissionError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PermissionError::Catalog(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }
}

#[derive(Debug)]
struct GroupState {
    priority: i32,
    branches: Arc<[PermissionBranch]>,
    is_default: bool,
}

/// A named, prioritised, ordered bundle of branches.
///
/// The id is fixed for the lifetime of the object; priority, branches and the
/// default flag are replaced in place on catalog reload.
#[derive(Debug)]
pub struct PermissionGroup {
    id: String,
    state: RwLock<GroupState>,
}

impl PermissionGroup {
    pub fn new(id: &str, priority: i32, branches: Vec<PermissionBranch>, is_default: bool) -> Self {
        Self {
            id: normalize_group_id(id),
            state: RwLock::new(GroupState {
                priority,
                branches: branches.into(),
                is_default,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn priority(&self) -> i32 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).priority
    }

    pub fn is_default(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).is_default
    }

    /// Snapshot of the branch list in config order.
    pub fn branches(&self) -> Arc<[PermissionBranch]> {
        Arc::clone(&self.state.read().unwrap_or_else(PoisonError::into_inner).branches)
    }

    fn update(&self, priority: i32, branches: Vec<PermissionBranch>, is_default: bool) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.priority = priority;
        state.branches = branches.into();
        state.is_default = is_default;
    }
}

/// Counts from a catalog reload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub updated: usize,
    pub added: usize,
    pub dropped: usize,
}

#[derive(Debug, Default)]
struct CatalogState {
    default_group: Option<Arc<PermissionGroup>>,
    /// Non-default groups, descending priority, ties in config order.
    ordered: Vec<Arc<PermissionGroup>>,
    by_id: HashMap<String, Arc<PermissionGroup>>,
}

/// The set of groups currently configured.
#[derive(Debug, Default)]
pub struct GroupCatalog {
    state: RwLock<CatalogState>,
}

/// Parse a definition's permission strings, skipping the ones that fail.
fn parse_branches(definition: &GroupDefinition) -> Vec<PermissionBranch> {
    definition
        .permissions
        .iter()
        .filter_map(|raw| match PermissionBranch::parse(raw) {
            Ok(branch) => Some(branch),
            Err(e) => {
                warn!(group = %definition.id, permission = %raw, error = %e, "Skipping invalid group permission");
                None
            }
        })
        .collect()
}

fn validate(snapshot: &CatalogSnapshot) -> Result<(), PermissionError> {
    let mut seen = HashSet::new();
    let mut default_id: Option<&str> = None;

    for definition in &snapshot.groups {
        let id = normalize_group_id(&definition.id);
        if id.is_empty() {
            return Err(PermissionError::Catalog("Group with empty id".to_string()));
        }
        if !seen.insert(id) {
            return Err(PermissionError::Catalog(format!(
                "Duplicate group id: {}",
                definition.id
            )));
        }
        if definition.default {
            if let Some(existing) = default_id {
                return Err(PermissionError::Catalog(format!(
                    "More than one default group: {} and {}",
                    existing, definition.id
                )));
            }
            default_id = Some(&definition.id);
        }
    }
    Ok(())
}

impl GroupCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from a snapshot.
    pub fn from_snapshot(snapshot: &CatalogSnapshot) -> Result<Self, PermissionError> {
        let catalog = Self::new();
        catalog.reload(snapshot)?;
        Ok(catalog)
    }

    /// Merge a new snapshot into the catalog.
    ///
    /// Existing groups (matched by id) are updated in place, new ones are
    /// created and groups missing from the snapshot are dropped. The whole
    /// swap happens under one write lock. An invalid snapshot leaves the
    /// catalog untouched.
    #[instrument(skip_all, fields(groups = snapshot.groups.len()))]
    pub fn reload(&self, snapshot: &CatalogSnapshot) -> Result<ReloadSummary, PermissionError> {
        validate(snapshot)?;

        let mut state = self
            .state
            .write()
            .map_err(|_| PermissionError::Catalog("Lock poisoned".to_string()))?;

        let mut summary = ReloadSummary::default();
        let mut by_id = HashMap::with_capacity(snapshot.groups.len());
        let mut default_group = None;
        let mut ordered = Vec::with_capacity(snapshot.groups.len());

        for definition in &snapshot.groups {
            let id = normalize_group_id(&definition.id);
            let branches = parse_branches(definition);

            let group = match state.by_id.get(&id) {
                Some(existing) => {
                    existing.update(definition.priority, branches, definition.default);
                    summary.updated += 1;
                    Arc::clone(existing)
                }
                None => {
                    summary.added += 1;
                    Arc::new(PermissionGroup::new(
                        &id,
                        definition.priority,
                        branches,
                        definition.default,
                    ))
                }
            };

            if definition.default {
                default_group = Some(Arc::clone(&group));
            } else {
                ordered.push(Arc::clone(&group));
            }
            by_id.insert(id, group);
        }

        summary.dropped = state
            .by_id
            .keys()
            .filter(|id| !by_id.contains_key(*id))
            .count();

        // Stable sort keeps config order for equal priorities.
        ordered.sort_by_key(|group| std::cmp::Reverse(group.priority()));

        state.by_id = by_id;
        state.ordered = ordered;
        state.default_group = default_group;

        info!(
            updated = summary.updated,
            added = summary.added,
            dropped = summary.dropped,
            "Reloaded group catalog"
        );
        Ok(summary)
    }

    /// The implicit group every user belongs to.
    pub fn default_group(&self) -> Option<Arc<PermissionGroup>> {
        self.read().default_group.clone()
    }

    /// Whether `id` names the default group.
    pub fn is_default_id(&self, id: &str) -> bool {
        self.read()
            .default_group
            .as_ref()
            .is_some_and(|group| group.id == normalize_group_id(id))
    }

    /// Look up any group, the default one included.
    pub fn get(&self, id: &str) -> Option<Arc<PermissionGroup>> {
        self.read().by_id.get(&normalize_group_id(id)).cloned()
    }

    /// Every non-default group, descending priority.
    pub fn groups(&self) -> Vec<Arc<PermissionGroup>> {
        self.read().ordered.clone()
    }

    /// Resolve stored group ids to catalog groups for resolution.
    ///
    /// The default group is dropped, unknown ids are ignored and the result
    /// follows catalog order (descending priority) rather than `ids` order.
    pub fn resolve_memberships<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a str>,
    ) -> Vec<Arc<PermissionGroup>> {
        let wanted: HashSet<String> = ids.into_iter().map(normalize_group_id).collect();
        let state = self.read();

        for id in &wanted {
            if !state.by_id.contains_key(id) {
                debug!(group = %id, "Ignoring membership in unknown group");
            }
        }

        state
            .ordered
            .iter()
            .filter(|group| wanted.contains(group.id()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CatalogState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}
