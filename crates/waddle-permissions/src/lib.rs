//! Waddle permission engine
//!
//! Decides whether a user holds a hierarchical, wildcard-capable permission
//! such as `app::moderation.kick`, from individually stored branches, the
//! implicit default group and the user's explicit groups.
//!
//! ```ignore
//! let db = Database::open("perms", config.database.path.as_deref()).await?;
//! MigrationRunner::records().run(&db).await?;
//!
//! let catalog = Arc::new(GroupCatalog::from_snapshot(&config.load_catalog()?)?);
//! let service = PermissionService::with_database(db, catalog);
//!
//! let leaf = PermissionLeaf::parse("app::chat.send")?;
//! let allowed = service.has_permission(user_id, &leaf, &CancellationToken::new()).await?;
//! ```

pub mod config;
pub mod db;
pub mod permissions;
pub mod telemetry;

pub use config::PermissionsConfig;
pub use db::{Database, DatabaseError, MigrationRunner};
pub use permissions::{
    CatalogSnapshot, CheckResponse, GroupCatalog, PermissionBranch, PermissionError,
    PermissionLeaf, PermissionService, UserId,
};
