//! Permission resolution
//!
//! A check walks the user's lists in a fixed order: individual branches, the
//! default group, then explicit groups by descending priority. Each list is
//! scanned from its newest entry to its oldest, threading a [`ScanState`]
//! through every list without resetting it.
//!
//! Two behaviours here are deliberate and covered by tests:
//!
//! - Within one list the *oldest* matching entry has the final say, because
//!   the scan runs backwards and later flag writes win. `[app::x, -app::x]`
//!   grants `app::x`.
//! - A superuser branch is consulted twice: once as the global short-circuit
//!   (suppressed after a `-*` was seen) and once through the ordinary
//!   containment check, which matches any leaf.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::branch::PermissionBranch;
use super::leaf::PermissionLeaf;
use super::path::Mode;
use super::record::UserId;
use super::store::PermissionStore;
use super::PermissionError;

/// Flags carried across every list of one check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanState {
    /// Set once a subtractive superuser branch is seen; never cleared.
    pub revoked_superuser: bool,
    pub added: bool,
    pub subtracted: bool,
}

/// How a check ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// An additive superuser branch short-circuited the check.
    Superuser,
    Granted,
    Denied,
}

impl Decision {
    pub fn is_granted(&self) -> bool {
        !matches!(self, Decision::Denied)
    }
}

/// Result of scanning one list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Decided(Decision),
    Undecided(ScanState),
}

impl ScanState {
    /// Scan one list from its last entry to its first.
    pub fn scan(mut self, branches: &[PermissionBranch], leaf: &PermissionLeaf) -> ScanOutcome {
        let matchable = leaf.is_valid();

        for branch in branches.iter().rev() {
            if !self.revoked_superuser && branch.is_superuser() {
                match branch.mode() {
                    Mode::Subtractive => self.revoked_superuser = true,
                    Mode::Additive => return ScanOutcome::Decided(Decision::Superuser),
                }
            }

            if matchable && branch.contains(leaf) {
                match branch.mode() {
                    Mode::Subtractive => self.subtracted = true,
                    Mode::Additive => {
                        self.added = true;
                        self.subtracted = false;
                    }
                }
            }
        }

        if self.added && !self.subtracted {
            ScanOutcome::Decided(Decision::Granted)
        } else if self.subtracted {
            ScanOutcome::Decided(Decision::Denied)
        } else {
            ScanOutcome::Undecided(self)
        }
    }
}

/// Fold [`ScanState::scan`] over `lists` in order. Returns the decision and
/// the index of the list that produced it, or `None` if no list decided.
pub fn resolve<'a, I>(lists: I, leaf: &PermissionLeaf) -> Option<(Decision, usize)>
where
    I: IntoIterator<Item = &'a [PermissionBranch]>,
{
    let mut state = ScanState::default();
    for (index, branches) in lists.into_iter().enumerate() {
        match state.scan(branches, leaf) {
            ScanOutcome::Decided(decision) => return Some((decision, index)),
            ScanOutcome::Undecided(next) => state = next,
        }
    }
    None
}

/// Which list a check consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListSource {
    Individual,
    DefaultGroup(String),
    Group(String),
}

impl fmt::Display for ListSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListSource::Individual => write!(f, "individual"),
            ListSource::DefaultGroup(id) => write!(f, "default-group:{}", id),
            ListSource::Group(id) => write!(f, "group:{}", id),
        }
    }
}

/// Request to check a permission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub user_id: UserId,
    pub permission: PermissionLeaf,
    /// Out-of-band trust signal from the caller, e.g. the process owner.
    #[serde(default)]
    pub caller_superuser: bool,
}

impl CheckRequest {
    pub fn new(user_id: UserId, permission: PermissionLeaf) -> Self {
        Self {
            user_id,
            permission,
            caller_superuser: false,
        }
    }

    pub fn as_caller_superuser(mut self) -> Self {
        self.caller_superuser = true;
        self
    }
}

/// Response from a permission check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl CheckResponse {
    /// Create an allowed response
    pub fn allowed(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: Some(reason.into()),
        }
    }

    /// Create a denied response
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Answers "does user U have leaf L" from the store's snapshots.
pub struct PermissionResolver {
    store: Arc<PermissionStore>,
}

impl PermissionResolver {
    pub fn new(store: Arc<PermissionStore>) -> Self {
        Self { store }
    }

    /// Check a permission
    #[instrument(skip(self, cancel), fields(user_id = request.user_id, permission = %request.permission))]
    pub async fn check(
        &self,
        request: &CheckRequest,
        cancel: &CancellationToken,
    ) -> Result<CheckResponse, PermissionError> {
        if request.caller_superuser {
            debug!("Caller is superuser");
            return Ok(CheckResponse::allowed("caller-superuser"));
        }

        let snapshot = self.store.snapshot(request.user_id, cancel).await?;
        let default_group = self.store.catalog().default_group();

        let mut lists: Vec<(ListSource, Arc<[PermissionBranch]>)> =
            Vec::with_capacity(snapshot.groups.len() + 2);
        lists.push((ListSource::Individual, Arc::clone(&snapshot.branches)));
        if let Some(group) = &default_group {
            lists.push((ListSource::DefaultGroup(group.id().to_string()), group.branches()));
        }
        for group in snapshot.groups.iter() {
            lists.push((ListSource::Group(group.id().to_string()), group.branches()));
        }

        let decided = resolve(lists.iter().map(|(_, branches)| &**branches), &request.permission);

        let response = match decided {
            Some((decision, index)) => {
                let source = &lists[index].0;
                match decision {
                    Decision::Superuser => CheckResponse::allowed(format!("superuser:{}", source)),
                    Decision::Granted => CheckResponse::allowed(source.to_string()),
                    Decision::Denied => CheckResponse::denied(source.to_string()),
                }
            }
            None => CheckResponse::denied("no-match"),
        };

        debug!(allowed = response.allowed, reason = ?response.reason, "Resolved permission");
        Ok(response)
    }

    /// Boolean form of [`Self::check`].
    pub async fn has_permission(
        &self,
        user_id: UserId,
        leaf: &PermissionLeaf,
        caller_superuser: bool,
        cancel: &CancellationToken,
    ) -> Result<bool, PermissionError> {
        let mut request = CheckRequest::new(user_id, leaf.clone());
        request.caller_superuser = caller_superuser;
        Ok(self.check(&request, cancel).await?.allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branches(list: &[&str]) -> Vec<PermissionBranch> {
        list.iter().map(|s| PermissionBranch::parse(s).unwrap()).collect()
    }

    fn leaf(s: &str) -> PermissionLeaf {
        PermissionLeaf::parse(s).unwrap()
    }

    #[test]
    fn test_oldest_matching_entry_wins_within_a_list() {
        let list = branches(&["app::x", "-app::x"]);
        let outcome = ScanState::default().scan(&list, &leaf("app::x"));
        assert_eq!(outcome, ScanOutcome::Decided(Decision::Granted));

        let list = branches(&["-app::x", "app::x"]);
        let outcome = ScanState::default().scan(&list, &leaf("app::x"));
        assert_eq!(outcome, ScanOutcome::Decided(Decision::Denied));
    }

    #[test]
    fn test_whole_list_is_scanned() {
        let list = branches(&["-app::chat.*", "app::chat.send", "app::other"]);
        let outcome = ScanState::default().scan(&list, &leaf("app::chat.send"));
        assert_eq!(outcome, ScanOutcome::Decided(Decision::Denied));
    }

    #[test]
    fn test_no_match_carries_state() {
        let list = branches(&["app::y"]);
        let outcome = ScanState::default().scan(&list, &leaf("app::x"));
        assert_eq!(outcome, ScanOutcome::Undecided(ScanState::default()));
    }

    #[test]
    fn test_additive_superuser_short_circuits() {
        let list = branches(&["-app::x", "*"]);
        let outcome = ScanState::default().scan(&list, &leaf("app::x"));
        assert_eq!(outcome, ScanOutcome::Decided(Decision::Superuser));
    }

    #[test]
    fn test_revoked_superuser_is_sticky_across_lists() {
        let individual = branches(&["-*"]);
        let default_group = branches(&["*"]);
        let decided = resolve([&individual[..], &default_group[..]], &leaf("app::x"));
        assert_eq!(decided, Some((Decision::Denied, 0)));

        // With the revoke carried in, `*` no longer short-circuits but its
        // containment still counts as an ordinary additive match.
        let carried = ScanState {
            revoked_superuser: true,
            ..Default::default()
        };
        assert_eq!(
            carried.scan(&default_group, &leaf("app::x")),
            ScanOutcome::Decided(Decision::Granted)
        );
    }

    #[test]
    fn test_flags_are_not_reset_between_lists() {
        let carried = ScanState {
            subtracted: true,
            ..Default::default()
        };
        let list = branches(&["app::unrelated"]);
        assert_eq!(
            carried.scan(&list, &leaf("app::x")),
            ScanOutcome::Decided(Decision::Denied)
        );
    }

    #[test]
    fn test_invalid_leaf_only_matches_superuser_short_circuit() {
        let unknown = PermissionLeaf::new(crate::permissions::Domain::Unknown, "x");
        let list = branches(&["app::x", "-*"]);
        let outcome = ScanState::default().scan(&list, &unknown);
        assert_eq!(
            outcome,
            ScanOutcome::Undecided(ScanState {
                revoked_superuser: true,
                ..Default::default()
            })
        );
        assert_eq!(
            ScanState::default().scan(&branches(&["*"]), &unknown),
            ScanOutcome::Decided(Decision::Superuser)
        );
    }

    #[test]
    fn test_falls_back_through_lists_in_order() {
        let individual = branches(&["app::unrelated"]);
        let default_group = branches(&["app::other"]);
        let moderator = branches(&["-app::x"]);
        let helper = branches(&["app::x"]);
        let decided = resolve(
            [&individual[..], &default_group[..], &moderator[..], &helper[..]],
            &leaf("app::x"),
        );
        assert_eq!(decided, Some((Decision::Denied, 2)));
        assert_eq!(resolve([&individual[..]], &leaf("app::x")), None);
    }

    #[test]
    fn test_list_source_display() {
        assert_eq!(ListSource::Individual.to_string(), "individual");
        assert_eq!(ListSource::DefaultGroup("default".into()).to_string(), "default-group:default");
        assert_eq!(ListSource::Group("vip".into()).to_string(), "group:vip");
    }
}
