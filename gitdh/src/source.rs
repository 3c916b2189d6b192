//! Revision sources: turn a trigger into the set of branches that moved.
//!
//! [`PushSource`] wraps one post-receive line, [`PollSource`] compares every
//! configured branch tip. Both start events from the revision in the state
//! store and flag non-fast-forward transitions. A git failure on one branch
//! is reported as a [`BranchFailure`] and never hides the other branches; a
//! state store failure aborts the whole sweep.

use tracing::{debug, info, instrument, warn};

use crate::core::revision::{poll_event, push_event};
use crate::core::types::RevisionEvent;
use crate::error::{GitQueryError, StateStoreError};
use crate::io::git::GitQuery;
use crate::io::state_store::StateStore;
use crate::pool::map_bounded;

/// A branch that could not be checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchFailure {
    pub branch: String,
    pub message: String,
}

/// Events to deploy plus branches whose check failed.
#[derive(Debug, Default)]
pub struct SourcedEvents {
    pub events: Vec<RevisionEvent>,
    pub failures: Vec<BranchFailure>,
}

type BranchCheck = Result<RevisionEvent, BranchFailure>;

/// Something that knows which branches moved.
pub trait RevisionSource {
    fn produce_events(&self) -> Result<SourcedEvents, StateStoreError>;
}

/// Flag `event` as rewritten when its old revision is not an ancestor of the new one.
pub fn classify<G: GitQuery + ?Sized>(
    git: &G,
    event: RevisionEvent,
) -> Result<RevisionEvent, GitQueryError> {
    let Some(old) = event.old_revision() else {
        return Ok(event);
    };
    if git.is_ancestor(old, event.new_revision())? {
        return Ok(event);
    }
    warn!(
        branch = event.branch(),
        old = old,
        new = event.new_revision(),
        "non-fast-forward transition"
    );
    Ok(event.flag_rewritten())
}

/// One `<oldrev> <newrev> <refname>` line from a post-receive hook.
///
/// The event starts from the branch's stored revision, since that is what
/// the state store will compare against. A pushed `oldrev` that differs from
/// it only contributes to rewrite detection.
pub struct PushSource<'a, G: ?Sized, S: ?Sized> {
    git: &'a G,
    store: &'a S,
    oldrev: String,
    newrev: String,
    refname: String,
}

impl<'a, G, S> PushSource<'a, G, S>
where
    G: GitQuery + ?Sized,
    S: StateStore + ?Sized,
{
    pub fn new(git: &'a G, store: &'a S, oldrev: &str, newrev: &str, refname: &str) -> Self {
        Self {
            git,
            store,
            oldrev: oldrev.to_string(),
            newrev: newrev.to_string(),
            refname: refname.to_string(),
        }
    }

    /// Move `pushed` onto the stored revision, flagging a rewrite against
    /// either starting point.
    fn rebase_on_stored(
        &self,
        pushed: RevisionEvent,
        stored: Option<String>,
    ) -> Result<RevisionEvent, GitQueryError> {
        let pushed = classify(self.git, pushed)?;
        if stored.as_deref() == pushed.old_revision() {
            return Ok(pushed);
        }
        let Some(rebased) = pushed.clone().rebase(stored) else {
            // Already stored; the deployer reports it as such.
            return Ok(pushed);
        };
        debug!(
            branch = rebased.branch(),
            pushed = pushed.old_revision_or_null(),
            stored = rebased.old_revision_or_null(),
            "stored revision differs from pushed oldrev"
        );
        if rebased.rewritten() {
            return Ok(rebased);
        }
        classify(self.git, rebased)
    }
}

impl<G, S> RevisionSource for PushSource<'_, G, S>
where
    G: GitQuery + ?Sized,
    S: StateStore + ?Sized,
{
    #[instrument(skip_all, fields(refname = %self.refname))]
    fn produce_events(&self) -> Result<SourcedEvents, StateStoreError> {
        let mut sourced = SourcedEvents::default();
        let Some(event) = push_event(&self.oldrev, &self.newrev, &self.refname) else {
            debug!("push does not move a branch");
            return Ok(sourced);
        };
        let branch = event.branch().to_string();
        let stored = self.store.get(&branch)?;
        match self.rebase_on_stored(event, stored) {
            Ok(event) => sourced.events.push(event),
            Err(err) => sourced.failures.push(BranchFailure {
                branch,
                message: err.to_string(),
            }),
        }
        Ok(sourced)
    }
}

/// Sweep over configured branches, comparing tips with the state store.
pub struct PollSource<'a, G: ?Sized, S: ?Sized> {
    git: &'a G,
    store: &'a S,
    branches: Vec<String>,
    workers: usize,
}

impl<'a, G, S> PollSource<'a, G, S>
where
    G: GitQuery + ?Sized,
    S: StateStore + ?Sized,
{
    pub fn new(git: &'a G, store: &'a S, branches: Vec<String>, workers: usize) -> Self {
        Self {
            git,
            store,
            branches,
            workers,
        }
    }

    /// `None` when the branch did not move.
    fn check_branch(&self, branch: &str) -> Result<Option<BranchCheck>, StateStoreError> {
        let failure = |err: GitQueryError| BranchFailure {
            branch: branch.to_string(),
            message: err.to_string(),
        };
        let tip = match self.git.tip_revision(branch) {
            Ok(tip) => tip,
            Err(err) => {
                warn!(branch, err = %err, "can't resolve branch tip");
                return Ok(Some(Err(failure(err))));
            }
        };
        let stored = self.store.get(branch)?;
        let Some(event) = poll_event(branch, stored.as_deref(), &tip) else {
            debug!(branch, rev = %tip, "branch unchanged");
            return Ok(None);
        };
        Ok(Some(classify(self.git, event).map_err(failure)))
    }
}

impl<G, S> RevisionSource for PollSource<'_, G, S>
where
    G: GitQuery + ?Sized,
    S: StateStore + ?Sized,
{
    #[instrument(skip_all, fields(branches = self.branches.len(), workers = self.workers))]
    fn produce_events(&self) -> Result<SourcedEvents, StateStoreError> {
        let checks = map_bounded(&self.branches, self.workers, |branch| {
            self.check_branch(branch)
        });

        let mut sourced = SourcedEvents::default();
        for check in checks {
            match check? {
                Some(Ok(event)) => sourced.events.push(event),
                Some(Err(failure)) => sourced.failures.push(failure),
                None => {}
            }
        }
        info!(
            moved = sourced.events.len(),
            failed = sourced.failures.len(),
            "poll finished"
        );
        Ok(sourced)
    }
}
