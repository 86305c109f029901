//! Wildcard-capable, signed permission rules
//!
//! A branch grants (`Additive`) or revokes (`Subtractive`) every leaf it
//! contains. Containment follows the wildcard algebra:
//!
//! - an absolute branch (`wildcard_level == 0`) contains only the equal path
//! - `a.b.*` (`wildcard_level == 3`) contains `a.b` itself and anything below
//!   `a.b.`, but not `a.c`
//! - the superuser branch `*` contains everything, in every domain, whatever
//!   its own mode

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::leaf::PermissionLeaf;
use super::path::{self, Domain, Mode, ParsedPath, SEGMENT_SEPARATOR, WILDCARD};
use super::PermissionError;

/// A permission rule as stored in records and group definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermissionBranch {
    domain: Domain,
    path: String,
    wildcard_level: usize,
    mode: Mode,
    superuser: bool,
}

impl PermissionBranch {
    /// Build a scoped branch from known components. The wildcard level is
    /// derived from the path.
    pub fn new(domain: Domain, path: impl Into<String>, mode: Mode) -> Self {
        let path = path.into();
        Self {
            domain,
            wildcard_level: path::wildcard_level(&path),
            path,
            mode,
            superuser: false,
        }
    }

    /// The universal `*` branch.
    pub fn superuser(mode: Mode) -> Self {
        Self {
            domain: Domain::Unknown,
            path: WILDCARD.to_string(),
            wildcard_level: 1,
            mode,
            superuser: true,
        }
    }

    /// Additive application-domain branch.
    pub fn grant(path: impl Into<String>) -> Self {
        Self::new(Domain::Application, path, Mode::Additive)
    }

    /// Subtractive application-domain branch.
    pub fn revoke(path: impl Into<String>) -> Self {
        Self::new(Domain::Application, path, Mode::Subtractive)
    }

    /// Parse from `[+|-]<domain>::<path>` or `[+|-]*`
    pub fn parse(s: &str) -> Result<Self, PermissionError> {
        Ok(match path::parse(s)? {
            ParsedPath::Superuser { mode } => Self::superuser(mode),
            ParsedPath::Scoped {
                mode,
                domain,
                path,
                wildcard_level,
            } => Self {
                domain,
                path: path.to_string(),
                wildcard_level,
                mode,
                superuser: false,
            },
        })
    }

    /// Non-failing form of [`PermissionBranch::parse`].
    pub fn try_parse(s: &str) -> Option<Self> {
        Self::parse(s).ok()
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn wildcard_level(&self) -> usize {
        self.wildcard_level
    }

    pub fn is_superuser(&self) -> bool {
        self.superuser
    }

    pub fn is_subtractive(&self) -> bool {
        self.mode == Mode::Subtractive
    }

    /// Whether the branch can take part in matching.
    pub fn is_valid(&self) -> bool {
        self.superuser || (self.domain.is_known() && !self.path.is_empty())
    }

    /// Path with the trailing `.*` removed, e.g. `a.b` for `a.b.*`.
    fn stem(&self) -> &str {
        self.path
            .strip_suffix(WILDCARD)
            .map(|rest| rest.strip_suffix(SEGMENT_SEPARATOR).unwrap_or(rest))
            .unwrap_or(&self.path)
    }

    /// Path with the trailing `*` removed, e.g. `a.b.` for `a.b.*`.
    fn wildcard_prefix(&self) -> &str {
        self.path.strip_suffix(WILDCARD).unwrap_or(&self.path)
    }

    /// Core containment rule shared by the leaf and branch forms.
    fn contains_path(&self, domain: Domain, other_path: &str) -> bool {
        if self.domain != domain {
            return false;
        }

        if self.wildcard_level == 0 {
            return path::paths_equal(&self.path, other_path);
        }

        let level = path::level(other_path);
        let required = self.wildcard_level - 1;
        if level < required {
            return false;
        }
        if level == required {
            return path::paths_equal(self.stem(), other_path);
        }
        path::starts_with_ignore_case(other_path, self.wildcard_prefix())
    }

    /// Whether this branch covers `leaf`. Performs no validity check; callers
    /// gate on [`PermissionLeaf::is_valid`].
    pub fn contains(&self, leaf: &PermissionLeaf) -> bool {
        if self.superuser {
            return true;
        }
        self.contains_path(leaf.domain(), leaf.path())
    }

    /// Whether this branch contains `other`.
    ///
    /// Besides the path rule, `other` must have a wildcard level at least as
    /// high as this branch's. Absolute branches have level 0, so a wildcard
    /// branch never contains one; an absolute branch contains only branches
    /// with the same path.
    pub fn contains_branch(&self, other: &PermissionBranch) -> bool {
        if self.superuser {
            return true;
        }
        if other.superuser || other.wildcard_level < self.wildcard_level {
            return false;
        }
        self.contains_path(other.domain, &other.path)
    }

    /// Equality that disregards the additive/subtractive sign.
    pub fn equals_ignoring_mode(&self, other: &PermissionBranch) -> bool {
        if self.superuser || other.superuser {
            return self.superuser == other.superuser;
        }
        self.domain == other.domain
            && self.wildcard_level == other.wildcard_level
            && path::paths_equal(&self.path, &other.path)
    }
}

impl PartialEq for PermissionBranch {
    fn eq(&self, other: &Self) -> bool {
        self.mode == other.mode && self.equals_ignoring_mode(other)
    }
}

impl Eq for PermissionBranch {}

impl Hash for PermissionBranch {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mode.hash(state);
        self.superuser.hash(state);
        if !self.superuser {
            self.domain.hash(state);
            self.path.to_ascii_lowercase().hash(state);
        }
    }
}

impl fmt::Display for PermissionBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mode.sign())?;
        if self.superuser {
            write!(f, "{}", WILDCARD)
        } else {
            path::write_scoped(f, self.domain, &self.path)
        }
    }
}

impl FromStr for PermissionBranch {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PermissionBranch::parse(s)
    }
}

impl TryFrom<String> for PermissionBranch {
    type Error = PermissionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        PermissionBranch::parse(&s)
    }
}

impl From<PermissionBranch> for String {
    fn from(branch: PermissionBranch) -> Self {
        branch.to_string()
    }
}

impl From<&PermissionLeaf> for PermissionBranch {
    /// Promote a leaf to the additive absolute branch covering exactly it.
    fn from(leaf: &PermissionLeaf) -> Self {
        PermissionBranch::new(leaf.domain(), leaf.path(), Mode::Additive)
    }
}
