//! waddle-perms - administer and query Waddle permissions.
//!
//! Every command prints JSON on stdout; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use waddle_permissions::permissions::{
    encode_branch, GroupCatalog, PermissionBranch, PermissionLeaf, PermissionService, UserId,
};
use waddle_permissions::{telemetry, Database, MigrationRunner, PermissionsConfig};

/// Waddle permission administration
#[derive(Parser)]
#[command(name = "waddle-perms")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: ./waddle-perms.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overriding the configured one
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Group catalog file, overriding the configured one
    #[arg(short, long, global = true)]
    groups: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a user holds a permission
    Check {
        user: UserId,

        /// Absolute permission, e.g. app::chat.send
        permission: String,

        /// Treat the caller as a trusted superuser
        #[arg(long)]
        caller_superuser: bool,
    },
    /// Store permission branches for a user (prefix with - to store a revoke)
    Grant {
        user: UserId,

        #[arg(required = true, allow_hyphen_values = true)]
        branches: Vec<String>,
    },
    /// Remove stored permission branches of a user
    Revoke {
        user: UserId,

        #[arg(required = true, allow_hyphen_values = true)]
        branches: Vec<String>,
    },
    /// Add a user to groups
    Join {
        user: UserId,

        #[arg(required = true)]
        groups: Vec<String>,
    },
    /// Remove a user from groups
    Leave {
        user: UserId,

        #[arg(required = true)]
        groups: Vec<String>,
    },
    /// Show a user's stored branches and effective groups
    Show { user: UserId },
    /// List the configured groups
    Groups,
    /// Parse a permission and print its structure
    Parse {
        #[arg(allow_hyphen_values = true)]
        permission: String,
    },
}

fn parse_branches(raw: &[String]) -> Result<Vec<PermissionBranch>> {
    raw.iter()
        .map(|s| PermissionBranch::parse(s).with_context(|| format!("Invalid permission: {}", s)))
        .collect()
}

fn print(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn describe(input: &str) -> Result<Value> {
    let branch = PermissionBranch::parse(input).context("Not a permission")?;

    let mut wire = Vec::new();
    encode_branch(Some(&branch), &mut wire)?;
    let wire: String = wire.iter().map(|b| format!("{:02x}", b)).collect();

    Ok(json!({
        "input": input,
        "canonical": branch.to_string(),
        "domain": branch.domain(),
        "path": branch.path(),
        "mode": branch.mode(),
        "wildcard_level": branch.wildcard_level(),
        "superuser": branch.is_superuser(),
        "leaf": PermissionLeaf::try_from(&branch).is_ok(),
        "wire": wire,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        PermissionsConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if cli.database.is_some() {
        config.database.path = cli.database;
    }
    if cli.groups.is_some() {
        config.groups_file = cli.groups;
    }

    telemetry::init(&config.log.filter, config.log.json)
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    let output = match cli.command {
        // Needs neither database nor catalog
        Commands::Parse { permission } => describe(&permission)?,
        command => run(command, &open_service(&config).await?).await?,
    };

    print(&output)
}

async fn open_service(config: &PermissionsConfig) -> Result<PermissionService> {
    let snapshot = config.load_catalog().context("Failed to load group catalog")?;
    let catalog = Arc::new(GroupCatalog::from_snapshot(&snapshot).context("Invalid group catalog")?);

    let db = Database::open("waddle-perms", config.database.path.as_deref())
        .await
        .context("Failed to open database")?;
    MigrationRunner::records()
        .run(&db)
        .await
        .context("Failed to run migrations")?;

    Ok(PermissionService::with_database(db, catalog))
}

async fn run(command: Commands, service: &PermissionService) -> Result<Value> {
    let cancel = CancellationToken::new();

    let output = match command {
        Commands::Check {
            user,
            permission,
            caller_superuser,
        } => {
            let leaf = PermissionLeaf::parse(&permission)
                .with_context(|| format!("Invalid permission: {}", permission))?;
            let response = service.check(user, &leaf, caller_superuser, &cancel).await?;
            json!({ "user": user, "permission": leaf, "response": response })
        }
        Commands::Grant { user, branches } => {
            let added = service.add_permissions(user, &parse_branches(&branches)?).await?;
            info!(user, added, "Granted permissions");
            json!({ "user": user, "added": added })
        }
        Commands::Revoke { user, branches } => {
            let removed = service
                .remove_permissions(user, &parse_branches(&branches)?)
                .await?;
            info!(user, removed, "Revoked permissions");
            json!({ "user": user, "removed": removed })
        }
        Commands::Join { user, groups } => {
            let ids: Vec<&str> = groups.iter().map(String::as_str).collect();
            let added = service.add_groups(user, &ids).await?;
            json!({ "user": user, "added": added })
        }
        Commands::Leave { user, groups } => {
            let ids: Vec<&str> = groups.iter().map(String::as_str).collect();
            let removed = service.remove_groups(user, &ids).await?;
            json!({ "user": user, "removed": removed })
        }
        Commands::Show { user } => {
            let snapshot = service.store.snapshot(user, &cancel).await?;
            let groups: Vec<&str> = snapshot.groups.iter().map(|g| g.id()).collect();
            json!({
                "user": user,
                "permissions": &*snapshot.branches,
                "default_group": service.catalog().default_group().map(|g| g.id().to_string()),
                "groups": groups,
            })
        }
        Commands::Groups => {
            let catalog = service.catalog();
            let mut groups = Vec::with_capacity(catalog.len());
            for group in catalog.default_group().into_iter().chain(catalog.groups()) {
                groups.push(json!({
                    "id": group.id(),
                    "priority": group.priority(),
                    "default": group.is_default(),
                    "permissions": &*group.branches(),
                }));
            }
            Value::Array(groups)
        }
        Commands::Parse { permission } => describe(&permission)?,
    };

    Ok(output)
}
