//! Test-only helpers: in-memory fakes for the engine seams and a scratch git
//! repository driven through plumbing commands.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::exec_env::VAR_BRANCH;
use crate::core::types::DeploymentRecord;
use crate::error::{ExecutionError, GitQueryError, StateStoreError};
use crate::io::config_resolver::{CONFIG_BRANCH, CONFIG_FILE};
use crate::io::executor::{ExecOutcome, ExecRequest, Executor};
use crate::io::git::GitQuery;
use crate::io::state_store::{StateStore, latest_revision};

/// Scripted [`GitQuery`] with fixed branches, files and ancestry.
///
/// Every pair not registered through [`FakeGit::with_rewrite`] is treated as
/// a fast-forward.
#[derive(Debug, Clone, Default)]
pub struct FakeGit {
    branches: BTreeMap<String, String>,
    files: BTreeMap<(String, String), Vec<u8>>,
    rewrites: BTreeSet<(String, String)>,
    broken: BTreeSet<String>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_branch(mut self, branch: &str, tip: &str) -> Self {
        self.branches.insert(branch.to_string(), tip.to_string());
        self
    }

    pub fn with_file(mut self, branch: &str, path: &str, content: impl AsRef<[u8]>) -> Self {
        self.files.insert(
            (branch.to_string(), path.to_string()),
            content.as_ref().to_vec(),
        );
        self
    }

    /// Mark `old -> new` as a non-fast-forward transition.
    pub fn with_rewrite(mut self, old: &str, new: &str) -> Self {
        self.rewrites.insert((old.to_string(), new.to_string()));
        self
    }

    /// Make every query about `branch` fail.
    pub fn with_broken_branch(mut self, branch: &str) -> Self {
        self.broken.insert(branch.to_string());
        self
    }
}

impl GitQuery for FakeGit {
    fn list_branches(&self) -> Result<Vec<String>, GitQueryError> {
        Ok(self.branches.keys().cloned().collect())
    }

    fn tip_revision(&self, branch: &str) -> Result<String, GitQueryError> {
        if self.broken.contains(branch) {
            return Err(GitQueryError::Failed {
                args: format!("rev-parse {branch}"),
                stderr: "fatal: bad object".to_string(),
            });
        }
        self.branches
            .get(branch)
            .cloned()
            .ok_or_else(|| GitQueryError::UnknownBranch {
                branch: branch.to_string(),
            })
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitQueryError> {
        Ok(!self
            .rewrites
            .contains(&(ancestor.to_string(), descendant.to_string())))
    }

    fn file_content_at(&self, branch: &str, path: &str) -> Result<Option<Vec<u8>>, GitQueryError> {
        Ok(self
            .files
            .get(&(branch.to_string(), path.to_string()))
            .cloned())
    }
}

/// In-memory [`StateStore`] sharing the file store's CAS semantics.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    branches: Mutex<BTreeMap<String, Vec<DeploymentRecord>>>,
    fail_reads: bool,
    fail_writes: bool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose writes fail as if the backing medium were unreachable.
    pub fn unwritable() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    /// Store that can't even be read.
    pub fn unreadable() -> Self {
        Self {
            fail_reads: true,
            fail_writes: true,
            ..Self::default()
        }
    }

    fn guard(failing: bool) -> Result<(), StateStoreError> {
        if failing {
            return Err(StateStoreError::Io {
                path: PathBuf::from("memory"),
                source: std::io::Error::other("store unreachable"),
            });
        }
        Ok(())
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, branch: &str) -> Result<Option<String>, StateStoreError> {
        Self::guard(self.fail_reads)?;
        let branches = self.branches.lock().expect("state lock");
        Ok(branches
            .get(branch)
            .and_then(|records| latest_revision(records))
            .map(str::to_string))
    }

    fn compare_and_set_record(
        &self,
        expected_old: Option<&str>,
        record: DeploymentRecord,
    ) -> Result<bool, StateStoreError> {
        Self::guard(self.fail_writes)?;
        let mut branches = self.branches.lock().expect("state lock");
        let records = branches.entry(record.branch.clone()).or_default();
        if latest_revision(records) != expected_old {
            return Ok(false);
        }
        records.push(record);
        Ok(true)
    }

    fn record(&self, record: DeploymentRecord) -> Result<(), StateStoreError> {
        Self::guard(self.fail_writes)?;
        let mut branches = self.branches.lock().expect("state lock");
        branches
            .entry(record.branch.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    fn history(&self, branch: &str) -> Result<Vec<DeploymentRecord>, StateStoreError> {
        let branches = self.branches.lock().expect("state lock");
        Ok(branches.get(branch).cloned().unwrap_or_default())
    }
}

/// [`Executor`] that records requests and fails the commands it was told to.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    failing: BTreeSet<String>,
    requests: Mutex<Vec<ExecRequest>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `command` exit with status 1.
    pub fn failing(mut self, command: &str) -> Self {
        self.failing.insert(command.to_string());
        self
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// `(branch, command)` pairs in execution order.
    pub fn executed(&self) -> Vec<(String, String)> {
        self.requests()
            .into_iter()
            .map(|r| {
                let branch = r.env.get(VAR_BRANCH).unwrap_or_default().to_string();
                (branch, r.command)
            })
            .collect()
    }
}

impl Executor for ScriptedExecutor {
    fn exec(&self, request: &ExecRequest) -> ExecOutcome {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        if self.failing.contains(&request.command) {
            return ExecOutcome::failure(
                format!("{} failed\n", request.command),
                ExecutionError::Failed {
                    command: request.command.clone(),
                    code: Some(1),
                },
            );
        }
        ExecOutcome::success(format!("{} ok\n", request.command))
    }
}

/// Scratch git repository in a temp dir.
///
/// Commits are created with plumbing (`hash-object`, `update-index`,
/// `commit-tree`) so branches can be built without touching a worktree.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("tempdir")?;
        let repo = Self { dir };
        repo.git(&["init", "--quiet"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Commit `content` as `file` on top of `branch` (created if missing).
    /// Returns the new commit id.
    pub fn commit_file(&self, branch: &str, file: &str, content: &str) -> Result<String> {
        let parent = self.try_rev(&format!("refs/heads/{branch}"))?;
        let index = self.path().join(".git").join("test-support-index");
        let _ = std::fs::remove_file(&index);

        let blob = self.git_stdin(&["hash-object", "-w", "--stdin"], content.as_bytes())?;
        if let Some(parent) = &parent {
            self.git_with_index(&index, &["read-tree", parent])?;
        }
        self.git_with_index(
            &index,
            &[
                "update-index",
                "--add",
                "--cacheinfo",
                &format!("100644,{blob},{file}"),
            ],
        )?;
        let tree = self.git_with_index(&index, &["write-tree"])?;
        let _ = std::fs::remove_file(&index);

        let message = format!("update {file}");
        let mut args = vec!["commit-tree", tree.as_str(), "-m", message.as_str()];
        if let Some(parent) = &parent {
            args.push("-p");
            args.push(parent.as_str());
        }
        let commit = self.git(&args)?;
        self.git(&["update-ref", &format!("refs/heads/{branch}"), &commit])?;
        Ok(commit)
    }

    /// Point `branch` at `rev` (simulates a force push).
    pub fn reset_branch(&self, branch: &str, rev: &str) -> Result<()> {
        self.git(&["update-ref", &format!("refs/heads/{branch}"), rev])?;
        Ok(())
    }

    /// Commit `content` as `gitdh.conf` on the `gitdh` branch.
    pub fn write_config_branch(&self, content: &str) -> Result<String> {
        self.commit_file(CONFIG_BRANCH, CONFIG_FILE, content)
    }

    fn try_rev(&self, spec: &str) -> Result<Option<String>> {
        let out = self
            .command(&["rev-parse", "--verify", "--quiet", spec])
            .output()
            .context("spawn git rev-parse")?;
        if out.status.success() {
            Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
        } else {
            Ok(None)
        }
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let out = self
            .command(args)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        capture(args, out)
    }

    fn git_with_index(&self, index: &Path, args: &[&str]) -> Result<String> {
        let out = self
            .command(args)
            .env("GIT_INDEX_FILE", index)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        capture(args, out)
    }

    fn git_stdin(&self, args: &[&str], input: &[u8]) -> Result<String> {
        let mut child = self
            .command(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?
            .write_all(input)
            .context("write stdin")?;
        let out = child.wait_with_output().context("wait git")?;
        capture(args, out)
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(self.path())
            .env_remove("GIT_DIR")
            .env("GIT_AUTHOR_NAME", "gitdh tests")
            .env("GIT_AUTHOR_EMAIL", "tests@example.invalid")
            .env("GIT_COMMITTER_NAME", "gitdh tests")
            .env("GIT_COMMITTER_EMAIL", "tests@example.invalid");
        cmd
    }
}

fn capture(args: &[&str], out: std::process::Output) -> Result<String> {
    if !out.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}
