//! Configuration for the permission engine.
//!
//! Sources, later ones overriding earlier ones:
//! - Built-in defaults
//! - `waddle-perms.toml` in the working directory, or an explicit file
//! - Environment variables prefixed `WADDLE_PERMS__`, nested with `__`
//!   (e.g. `WADDLE_PERMS__DATABASE__PATH=/var/lib/waddle/perms.db`)

use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::permissions::{CatalogSnapshot, PermissionError};

/// Config file looked up when none is given explicitly.
pub const DEFAULT_CONFIG_FILE: &str = "waddle-perms.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "WADDLE_PERMS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file. In-memory when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info,waddle_permissions=debug".to_string(),
            json: false,
        }
    }
}

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    pub database: DatabaseConfig,
    /// TOML group catalog with `[[groups]]` tables.
    pub groups_file: Option<PathBuf>,
    pub log: LogConfig,
}

impl PermissionsConfig {
    /// Load configuration. An explicit `path` must exist; the default file
    /// is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).format(FileFormat::Toml).required(true),
            None => File::new(DEFAULT_CONFIG_FILE, FileFormat::Toml).required(false),
        };

        Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Read the configured group catalog. No file means no groups.
    pub fn load_catalog(&self) -> Result<CatalogSnapshot, PermissionError> {
        match &self.groups_file {
            Some(path) => {
                let snapshot = CatalogSnapshot::from_file(path)?;
                info!(path = %path.display(), groups = snapshot.groups.len(), "Loaded group catalog");
                Ok(snapshot)
            }
            None => Ok(CatalogSnapshot::default()),
        }
    }
}
