//! Shared deterministic types for deployment decisions.
//!
//! These types define stable contracts between the revision sources, the
//! deployment executor and the state store. They do not touch I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Revision git reports for "no revision" (new or deleted refs).
pub const NULL_REVISION: &str = "0000000000000000000000000000000000000000";

/// True if `rev` is git's all-zero null revision (any length).
pub fn is_null_revision(rev: &str) -> bool {
    !rev.is_empty() && rev.bytes().all(|b| b == b'0')
}

/// A branch moved from `old_revision` to `new_revision`.
///
/// `old_revision == None` means the branch was never deployed (newly
/// observed). Events with equal old and new revisions cannot be built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevisionEvent {
    branch: String,
    old_revision: Option<String>,
    new_revision: String,
    rewritten: bool,
}

impl RevisionEvent {
    /// Build an event, or `None` when there is no transition.
    pub fn new(
        branch: impl Into<String>,
        old_revision: Option<String>,
        new_revision: impl Into<String>,
    ) -> Option<Self> {
        let new_revision = new_revision.into();
        let old_revision = old_revision.filter(|old| !is_null_revision(old));
        if old_revision.as_deref() == Some(new_revision.as_str()) {
            return None;
        }
        Some(Self {
            branch: branch.into(),
            old_revision,
            new_revision,
            rewritten: false,
        })
    }

    /// Mark the transition as a non-fast-forward (history rewrite).
    pub fn flag_rewritten(mut self) -> Self {
        self.rewritten = true;
        self
    }

    /// Same transition starting from `old_revision` instead; `None` when
    /// that leaves nothing to move.
    pub fn rebase(self, old_revision: Option<String>) -> Option<Self> {
        let rewritten = self.rewritten;
        let event = Self::new(self.branch, old_revision, self.new_revision)?;
        Some(Self { rewritten, ..event })
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn old_revision(&self) -> Option<&str> {
        self.old_revision.as_deref()
    }

    pub fn new_revision(&self) -> &str {
        &self.new_revision
    }

    pub fn rewritten(&self) -> bool {
        self.rewritten
    }

    /// Old revision as git spells it (null sentinel for "none").
    pub fn old_revision_or_null(&self) -> &str {
        self.old_revision.as_deref().unwrap_or(NULL_REVISION)
    }
}

/// Result of one deployment attempt, as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployOutcome {
    /// Commands ran and exited zero.
    Deployed,
    /// First sighting recorded without running commands (`InitialDeploy = skip`).
    Baseline,
    /// Commands failed, timed out or could not be spawned.
    Failed,
    /// Non-fast-forward transition refused by `OnRewrite = refuse`.
    Refused,
}

impl DeployOutcome {
    /// Outcomes that move the branch's last deployed revision.
    pub fn advances_revision(self) -> bool {
        matches!(self, DeployOutcome::Deployed | DeployOutcome::Baseline)
    }
}

/// Durable trace of a deployment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub branch: String,
    pub revision: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: DeployOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DeploymentRecord {
    pub fn now(branch: &str, revision: &str, outcome: DeployOutcome) -> Self {
        Self {
            branch: branch.to_string(),
            revision: revision.to_string(),
            timestamp: Utc::now(),
            outcome,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
