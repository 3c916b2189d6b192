//! Explicit environment values for child processes.
//!
//! Every git call and deployment command gets its own freshly built
//! [`ExecEnv`]; the process's own environment is never mutated, so
//! branch executions stay independent when run in parallel.

use std::collections::BTreeMap;

use crate::core::types::RevisionEvent;

/// Variables git exports to hooks that would redirect child git calls.
pub const HOOK_GIT_VARS: [&str; 3] = ["GIT_DIR", "GIT_WORK_TREE", "GIT_INDEX_FILE"];

pub const VAR_REPOSITORY: &str = "GITDH_REPOSITORY";
pub const VAR_BRANCH: &str = "GITDH_BRANCH";
pub const VAR_OLDREV: &str = "GITDH_OLDREV";
pub const VAR_NEWREV: &str = "GITDH_NEWREV";
pub const VAR_REWRITTEN: &str = "GITDH_REWRITTEN";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecEnv {
    set: BTreeMap<String, String>,
    removed: Vec<String>,
}

impl ExecEnv {
    /// Inherited environment minus the hook-exported git variables.
    pub fn clean() -> Self {
        Self {
            set: BTreeMap::new(),
            removed: HOOK_GIT_VARS.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Clean environment carrying the variables of one deployment.
    pub fn for_deployment(repository: &str, event: &RevisionEvent) -> Self {
        Self::clean()
            .with(VAR_REPOSITORY, repository)
            .with(VAR_BRANCH, event.branch())
            .with(VAR_OLDREV, event.old_revision_or_null())
            .with(VAR_NEWREV, event.new_revision())
            .with(VAR_REWRITTEN, if event.rewritten() { "1" } else { "0" })
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.removed.retain(|v| v != key);
        self.set.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.set.get(key).map(String::as_str)
    }

    pub fn removes(&self, key: &str) -> bool {
        self.removed.iter().any(|v| v == key)
    }

    /// Variables set explicitly, in key order.
    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.set.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Inherited variables to drop.
    pub fn removed(&self) -> impl Iterator<Item = &str> {
        self.removed.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_env_names_event_fields() {
        let event = RevisionEvent::new("main", None, "abc")
            .expect("event")
            .flag_rewritten();
        let env = ExecEnv::for_deployment("/srv/repo", &event);

        assert_eq!(env.get(VAR_REPOSITORY), Some("/srv/repo"));
        assert_eq!(env.get(VAR_BRANCH), Some("main"));
        assert_eq!(
            env.get(VAR_OLDREV),
            Some(crate::core::types::NULL_REVISION)
        );
        assert_eq!(env.get(VAR_NEWREV), Some("abc"));
        assert_eq!(env.get(VAR_REWRITTEN), Some("1"));
        assert!(env.removes("GIT_DIR"));
    }

    #[test]
    fn explicit_values_win_over_removal() {
        let env = ExecEnv::clean().with("GIT_DIR", "/custom");
        assert!(!env.removes("GIT_DIR"));
        assert_eq!(env.get("GIT_DIR"), Some("/custom"));
    }
}
