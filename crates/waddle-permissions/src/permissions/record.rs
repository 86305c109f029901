//! Persisted per-user permission assignments
//!
//! A record is either an individual branch or a group membership. On disk it
//! is the row `(user_id, is_group, payload)` where `payload` is the canonical
//! branch text or the normalised group id.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::branch::PermissionBranch;
use super::group::normalize_group_id;
use super::PermissionError;

/// Account a record belongs to. `0` is reserved for "every user" in
/// invalidation messages and is never a real user.
pub type UserId = u64;

/// What a record assigns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RecordPayload {
    Individual(PermissionBranch),
    Group(String),
}

impl RecordPayload {
    /// Group membership with a normalised id.
    pub fn group(id: &str) -> Self {
        RecordPayload::Group(normalize_group_id(id))
    }

    pub fn is_group(&self) -> bool {
        matches!(self, RecordPayload::Group(_))
    }

    /// The persisted payload string.
    pub fn to_payload_string(&self) -> String {
        match self {
            RecordPayload::Individual(branch) => branch.to_string(),
            RecordPayload::Group(id) => id.clone(),
        }
    }

    /// Rebuild from the persisted `(is_group, payload)` pair.
    pub fn from_stored(is_group: bool, payload: &str) -> Result<Self, PermissionError> {
        if is_group {
            let id = normalize_group_id(payload);
            if id.is_empty() {
                return Err(PermissionError::InvalidGroup(
                    "Group id cannot be empty".to_string(),
                ));
            }
            Ok(RecordPayload::Group(id))
        } else {
            Ok(RecordPayload::Individual(PermissionBranch::parse(payload)?))
        }
    }
}

impl fmt::Display for RecordPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordPayload::Individual(branch) => write!(f, "{}", branch),
            RecordPayload::Group(id) => write!(f, "group:{}", id),
        }
    }
}

/// One stored assignment for one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionRecord {
    pub user_id: UserId,
    pub payload: RecordPayload,
    /// Storage row this record was read from. The payload is normalised on
    /// read, so deletes go by row rather than by payload text.
    #[serde(skip)]
    pub row_id: Option<i64>,
}

impl PermissionRecord {
    pub fn new(user_id: UserId, payload: RecordPayload) -> Self {
        Self {
            user_id,
            payload,
            row_id: None,
        }
    }

    /// A record read back from storage row `row_id`.
    pub fn stored(row_id: i64, user_id: UserId, payload: RecordPayload) -> Self {
        Self {
            user_id,
            payload,
            row_id: Some(row_id),
        }
    }

    pub fn individual(user_id: UserId, branch: PermissionBranch) -> Self {
        Self::new(user_id, RecordPayload::Individual(branch))
    }

    pub fn group(user_id: UserId, id: &str) -> Self {
        Self::new(user_id, RecordPayload::group(id))
    }

    pub fn is_group(&self) -> bool {
        self.payload.is_group()
    }

    /// The `(user_id, is_group, payload)` uniqueness key.
    pub fn key(&self) -> (UserId, bool, String) {
        (self.user_id, self.is_group(), self.payload.to_payload_string())
    }
}

impl fmt::Display for PermissionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user:{} {}", self.user_id, self.payload)
    }
}
