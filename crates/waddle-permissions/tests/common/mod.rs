//! Shared setup for permission engine integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use waddle_permissions::permissions::{
    CatalogSnapshot, GroupCatalog, PermissionBranch, PermissionLeaf, PermissionService,
};
use waddle_permissions::{Database, MigrationRunner};

/// Catalog used by most tests. Ties on priority keep file order.
pub const CATALOG: &str = r#"
[[groups]]
id = "default"
priority = 0
default = true
permissions = ["-app::chat.shout", "app::chat.*"]

[[groups]]
id = "moderator"
priority = 50
permissions = ["-app::moderation.ban", "app::moderation.*"]

[[groups]]
id = "helper"
priority = 10
permissions = ["app::help.*", "app::moderation.ban"]

[[groups]]
id = "muted"
priority = 10
permissions = ["-app::chat.*"]
"#;

pub fn catalog(toml: &str) -> Arc<GroupCatalog> {
    let snapshot = CatalogSnapshot::from_toml(toml).unwrap();
    Arc::new(GroupCatalog::from_snapshot(&snapshot).unwrap())
}

pub async fn migrated_memory_db(name: &str) -> Database {
    let db = Database::in_memory(name).await.unwrap();
    MigrationRunner::records().run(&db).await.unwrap();
    db
}

pub async fn migrated_file_db(name: &str, path: &Path) -> Database {
    let db = Database::open_local(name, path).await.unwrap();
    MigrationRunner::records().run(&db).await.unwrap();
    db
}

/// Service over an in-memory database and [`CATALOG`].
pub async fn setup_service() -> PermissionService {
    setup_service_with(CATALOG).await
}

pub async fn setup_service_with(toml: &str) -> PermissionService {
    PermissionService::with_database(migrated_memory_db("integration").await, catalog(toml))
}

pub fn leaf(s: &str) -> PermissionLeaf {
    PermissionLeaf::parse(s).unwrap()
}

pub fn branch(s: &str) -> PermissionBranch {
    PermissionBranch::parse(s).unwrap()
}

pub fn branches(list: &[&str]) -> Vec<PermissionBranch> {
    list.iter().map(|s| branch(s)).collect()
}
