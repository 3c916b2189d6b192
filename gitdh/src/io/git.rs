//! Git adapter for revision queries.
//!
//! The engine only reads from repositories, so we keep a small, explicit
//! wrapper around `git` subprocess calls behind the [`GitQuery`] seam.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tracing::{debug, instrument, warn};

use crate::core::exec_env::ExecEnv;
use crate::core::revision::BRANCH_REF_PREFIX;
use crate::error::GitQueryError;
use crate::io::process::apply_env;

/// Read-only repository queries the engine depends on.
///
/// Every call may fail; callers decide whether a failure aborts the
/// invocation or only the branch that needed it.
pub trait GitQuery: Send + Sync {
    /// Local branch names.
    fn list_branches(&self) -> Result<Vec<String>, GitQueryError>;

    /// Commit id at the tip of `branch`.
    fn tip_revision(&self, branch: &str) -> Result<String, GitQueryError>;

    /// True if `ancestor` is reachable from `descendant`.
    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitQueryError>;

    /// Content of `path` at the tip of `branch`, `None` if the file is absent.
    fn file_content_at(&self, branch: &str, path: &str) -> Result<Option<Vec<u8>>, GitQueryError>;
}

/// Wrapper for executing git commands against a repository directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn run_capture(&self, args: &[&str]) -> Result<Vec<u8>, GitQueryError> {
        let output = self.run_checked(args)?;
        Ok(output.stdout)
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output, GitQueryError> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitQueryError::Failed {
                args: args.join(" "),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output, GitQueryError> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        apply_env(&mut cmd, &ExecEnv::clean());
        cmd.output().map_err(|source| GitQueryError::Spawn {
            args: args.join(" "),
            source,
        })
    }
}

impl GitQuery for Git {
    #[instrument(skip_all, fields(repo = %self.workdir.display()))]
    fn list_branches(&self) -> Result<Vec<String>, GitQueryError> {
        let out = self.run_capture(&[
            "for-each-ref",
            "--format=%(refname:short)",
            BRANCH_REF_PREFIX,
        ])?;
        let branches: Vec<String> = String::from_utf8_lossy(&out)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        debug!(count = branches.len(), "listed branches");
        Ok(branches)
    }

    fn tip_revision(&self, branch: &str) -> Result<String, GitQueryError> {
        let spec = format!("{BRANCH_REF_PREFIX}{branch}^{{commit}}");
        let output = self.run(&["rev-parse", "--verify", "--quiet", &spec])?;
        if !output.status.success() {
            return Err(GitQueryError::UnknownBranch {
                branch: branch.to_string(),
            });
        }
        let rev = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(branch, rev = %rev, "resolved tip");
        Ok(rev)
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitQueryError> {
        // A rewritten history may have had the old commit pruned.
        let object = format!("{ancestor}^{{commit}}");
        if !self.run(&["cat-file", "-e", &object])?.status.success() {
            debug!(ancestor, "ancestor commit no longer exists");
            return Ok(false);
        }
        let args = ["merge-base", "--is-ancestor", ancestor, descendant];
        let output = self.run(&args)?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(ancestor, descendant, "ancestry check failed");
                Err(GitQueryError::Failed {
                    args: args.join(" "),
                    stderr: stderr.trim().to_string(),
                })
            }
        }
    }

    fn file_content_at(&self, branch: &str, path: &str) -> Result<Option<Vec<u8>>, GitQueryError> {
        let object = format!("{BRANCH_REF_PREFIX}{branch}:{path}");
        let exists = self.run(&["cat-file", "-e", &object])?.status.success();
        if !exists {
            debug!(branch, path, "file absent");
            return Ok(None);
        }
        self.run_capture(&["cat-file", "blob", &object]).map(Some)
    }
}
