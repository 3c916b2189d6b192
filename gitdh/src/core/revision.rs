//! Pure derivation of revision events from push arguments and poll results.

use crate::core::types::{RevisionEvent, is_null_revision};

/// Ref namespace holding local branches.
pub const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// Branch name for `refs/heads/<name>`; `None` for tags and other refs.
pub fn branch_from_ref(refname: &str) -> Option<&str> {
    refname
        .strip_prefix(BRANCH_REF_PREFIX)
        .filter(|name| !name.is_empty())
}

/// Event for a single post-receive line.
///
/// Yields nothing when the ref is not a branch, the branch was deleted, or
/// the revisions are equal.
pub fn push_event(oldrev: &str, newrev: &str, refname: &str) -> Option<RevisionEvent> {
    let branch = branch_from_ref(refname)?;
    if is_null_revision(newrev) {
        return None;
    }
    RevisionEvent::new(branch, Some(oldrev.to_string()), newrev)
}

/// Event for a polled branch whose tip differs from the stored revision.
pub fn poll_event(branch: &str, stored: Option<&str>, tip: &str) -> Option<RevisionEvent> {
    RevisionEvent::new(branch, stored.map(str::to_string), tip)
}
