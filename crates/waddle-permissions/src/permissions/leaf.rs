//! Absolute permission identifiers

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::branch::PermissionBranch;
use super::path::{self, Domain, ParsedPath};
use super::PermissionError;

/// An absolute, domain-qualified permission such as `app::chat.send`.
///
/// Leaves are what callers check for. They never carry a wildcard or a sign.
/// Equality is domain plus case-insensitive path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermissionLeaf {
    domain: Domain,
    path: String,
}

impl PermissionLeaf {
    /// Build a leaf from known components. No validation happens here; check
    /// [`PermissionLeaf::is_valid`] before matching.
    pub fn new(domain: Domain, path: impl Into<String>) -> Self {
        Self {
            domain,
            path: path.into(),
        }
    }

    /// Shorthand for an application-domain leaf.
    pub fn app(path: impl Into<String>) -> Self {
        Self::new(Domain::Application, path)
    }

    /// Shorthand for a core-domain leaf.
    pub fn core(path: impl Into<String>) -> Self {
        Self::new(Domain::Core, path)
    }

    /// Parse from `<domain>::<path>`
    pub fn parse(s: &str) -> Result<Self, PermissionError> {
        match path::parse(s)? {
            ParsedPath::Scoped {
                domain,
                path,
                wildcard_level: 0,
                ..
            } if !s.starts_with(['+', '-']) => Ok(Self::new(domain, path)),
            _ => Err(PermissionError::InvalidPath(format!(
                "Not an absolute permission: {}",
                s
            ))),
        }
    }

    /// Non-failing form of [`PermissionLeaf::parse`].
    pub fn try_parse(s: &str) -> Option<Self> {
        Self::parse(s).ok()
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Number of segments in the path.
    pub fn level(&self) -> usize {
        path::level(&self.path)
    }

    /// Whether the leaf can take part in matching.
    pub fn is_valid(&self) -> bool {
        self.domain.is_known() && !self.path.is_empty() && path::wildcard_level(&self.path) == 0
    }
}

impl PartialEq for PermissionLeaf {
    fn eq(&self, other: &Self) -> bool {
        self.domain == other.domain && path::paths_equal(&self.path, &other.path)
    }
}

impl Eq for PermissionLeaf {}

impl Hash for PermissionLeaf {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.domain.hash(state);
        self.path.to_ascii_lowercase().hash(state);
    }
}

impl fmt::Display for PermissionLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        path::write_scoped(f, self.domain, &self.path)
    }
}

impl FromStr for PermissionLeaf {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PermissionLeaf::parse(s)
    }
}

impl TryFrom<String> for PermissionLeaf {
    type Error = PermissionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        PermissionLeaf::parse(&s)
    }
}

impl From<PermissionLeaf> for String {
    fn from(leaf: PermissionLeaf) -> Self {
        leaf.to_string()
    }
}

impl TryFrom<&PermissionBranch> for PermissionLeaf {
    type Error = PermissionError;

    /// Degrade an absolute branch to a leaf, dropping its mode.
    fn try_from(branch: &PermissionBranch) -> Result<Self, Self::Error> {
        if branch.is_superuser() || branch.wildcard_level() > 0 {
            return Err(PermissionError::NotAbsolute(branch.to_string()));
        }
        Ok(Self::new(branch.domain(), branch.path()))
    }
}
