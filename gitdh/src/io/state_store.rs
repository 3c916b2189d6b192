//! Durable per-branch deployment state.
//!
//! Invocations are separate short-lived processes, so the store itself must
//! provide the compare-and-set guarantee. [`FileStateStore`] keeps a JSON
//! document of append-only [`DeploymentRecord`]s per branch and serializes
//! every read-modify-write through an exclusive `fs2` lock on a sibling
//! `.lock` file. The document is replaced atomically (temp file + rename), so
//! plain reads never observe a partial write.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::types::{DeployOutcome, DeploymentRecord};
use crate::error::StateStoreError;

pub const STATE_VERSION: u32 = 1;

/// Last-deployed revision per branch with compare-and-set updates.
pub trait StateStore: Send + Sync {
    /// Revision of the latest record that advanced `branch`.
    fn get(&self, branch: &str) -> Result<Option<String>, StateStoreError>;

    /// Append `record` only if the stored revision of `record.branch` equals
    /// `expected_old` (`None` = nothing stored). Returns `false` without side
    /// effects otherwise. `record.outcome` must advance the revision.
    fn compare_and_set_record(
        &self,
        expected_old: Option<&str>,
        record: DeploymentRecord,
    ) -> Result<bool, StateStoreError>;

    /// Append a record that does not advance the revision (failed, refused).
    fn record(&self, record: DeploymentRecord) -> Result<(), StateStoreError>;

    /// Every record for `branch`, oldest first.
    fn history(&self, branch: &str) -> Result<Vec<DeploymentRecord>, StateStoreError>;

    /// Advance `branch` from `expected_old` to `new_value` as a deployment.
    fn compare_and_set(
        &self,
        branch: &str,
        expected_old: Option<&str>,
        new_value: &str,
    ) -> Result<bool, StateStoreError> {
        self.compare_and_set_record(
            expected_old,
            DeploymentRecord::now(branch, new_value, DeployOutcome::Deployed),
        )
    }
}

/// On-disk document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    #[serde(default)]
    pub branches: BTreeMap<String, Vec<DeploymentRecord>>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            branches: BTreeMap::new(),
        }
    }
}

impl StateFile {
    pub fn latest_revision(&self, branch: &str) -> Option<&str> {
        latest_revision(self.branches.get(branch).map(Vec::as_slice).unwrap_or(&[]))
    }
}

/// Revision of the newest revision-advancing record.
pub fn latest_revision(records: &[DeploymentRecord]) -> Option<&str> {
    records
        .iter()
        .rev()
        .find(|r| r.outcome.advances_revision())
        .map(|r| r.revision.as_str())
}

/// JSON file store shared by all invocations targeting one repository.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        with_suffix(&self.path, ".lock")
    }

    fn io_error(&self, source: std::io::Error) -> StateStoreError {
        StateStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Run `f` on the loaded document while holding the exclusive lock.
    fn locked<T>(
        &self,
        f: impl FnOnce(&mut StateFile) -> (bool, T),
    ) -> Result<T, StateStoreError> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| self.io_error(e))?;
        lock_file
            .lock_exclusive()
            .map_err(|source| StateStoreError::Lock {
                path: lock_path.clone(),
                source,
            })?;

        let result = self.load().and_then(|mut state| {
            let (dirty, value) = f(&mut state);
            if dirty {
                self.save(&state)?;
            }
            Ok(value)
        });

        let _ = FileExt::unlock(&lock_file);
        result
    }

    /// Read the current document (empty if the file does not exist yet).
    pub fn load(&self) -> Result<StateFile, StateStoreError> {
        if !self.path.exists() {
            return Ok(StateFile::default());
        }
        let contents = fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        let state: StateFile =
            serde_json::from_str(&contents).map_err(|source| StateStoreError::Corrupted {
                path: self.path.clone(),
                source,
            })?;
        if state.version != STATE_VERSION {
            return Err(StateStoreError::Version {
                path: self.path.clone(),
                found: state.version,
                expected: STATE_VERSION,
            });
        }
        Ok(state)
    }

    fn save(&self, state: &StateFile) -> Result<(), StateStoreError> {
        let mut buf =
            serde_json::to_string_pretty(state).map_err(|source| StateStoreError::Corrupted {
                path: self.path.clone(),
                source,
            })?;
        buf.push('\n');
        write_atomic(&self.path, &buf).map_err(|e| self.io_error(e))
    }
}

impl StateStore for FileStateStore {
    fn get(&self, branch: &str) -> Result<Option<String>, StateStoreError> {
        let state = self.load()?;
        Ok(state.latest_revision(branch).map(str::to_string))
    }

    #[instrument(skip_all, fields(branch = %record.branch, revision = %record.revision))]
    fn compare_and_set_record(
        &self,
        expected_old: Option<&str>,
        record: DeploymentRecord,
    ) -> Result<bool, StateStoreError> {
        debug_assert!(record.outcome.advances_revision());
        self.locked(|state| {
            let current = state.latest_revision(&record.branch);
            if current != expected_old {
                debug!(current = ?current, expected = ?expected_old, "compare-and-set lost");
                return (false, false);
            }
            state
                .branches
                .entry(record.branch.clone())
                .or_default()
                .push(record);
            (true, true)
        })
    }

    fn record(&self, record: DeploymentRecord) -> Result<(), StateStoreError> {
        debug!(branch = %record.branch, outcome = ?record.outcome, "appending record");
        self.locked(|state| {
            state
                .branches
                .entry(record.branch.clone())
                .or_default()
                .push(record);
            (true, ())
        })
    }

    fn history(&self, branch: &str) -> Result<Vec<DeploymentRecord>, StateStoreError> {
        let state = self.load()?;
        Ok(state.branches.get(branch).cloned().unwrap_or_default())
    }
}

/// `path` with `suffix` appended to its file name.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = with_suffix(path, ".tmp");
    {
        let mut file = File::create(&tmp_path)?;
        std::io::Write::write_all(&mut file, contents.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn store() -> (tempfile::TempDir, FileStateStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStateStore::new(temp.path().join("state").join("gitdh.state.json"));
        (temp, store)
    }

    #[test]
    fn missing_file_means_nothing_deployed() {
        let (_temp, store) = store();
        assert_eq!(store.get("main").expect("get"), None);
        assert!(store.history("main").expect("history").is_empty());
    }

    #[test]
    fn compare_and_set_advances_only_from_expected() {
        let (_temp, store) = store();
        assert!(store.compare_and_set("main", None, "aaa").expect("cas"));
        assert_eq!(store.get("main").expect("get").as_deref(), Some("aaa"));

        assert!(!store.compare_and_set("main", None, "bbb").expect("cas"));
        assert!(!store.compare_and_set("main", Some("zzz"), "bbb").expect("cas"));
        assert_eq!(store.get("main").expect("get").as_deref(), Some("aaa"));

        assert!(store.compare_and_set("main", Some("aaa"), "bbb").expect("cas"));
        assert_eq!(store.get("main").expect("get").as_deref(), Some("bbb"));
        assert_eq!(store.history("main").expect("history").len(), 2);
    }

    #[test]
    fn failed_records_are_kept_but_do_not_advance() {
        let (_temp, store) = store();
        store.compare_and_set("main", None, "aaa").expect("cas");
        store
            .record(
                DeploymentRecord::now("main", "bbb", DeployOutcome::Failed)
                    .with_message("exit 1"),
            )
            .expect("record");

        assert_eq!(store.get("main").expect("get").as_deref(), Some("aaa"));
        let history = store.history("main").expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].outcome, DeployOutcome::Failed);
        assert_eq!(history[1].message.as_deref(), Some("exit 1"));
    }

    #[test]
    fn branches_are_independent() {
        let (_temp, store) = store();
        assert!(store.compare_and_set("main", None, "aaa").expect("cas"));
        assert!(store.compare_and_set("staging", None, "bbb").expect("cas"));
        assert_eq!(store.get("main").expect("get").as_deref(), Some("aaa"));
        assert_eq!(store.get("staging").expect("get").as_deref(), Some("bbb"));
    }

    #[test]
    fn racing_writers_have_exactly_one_winner() {
        let (_temp, store) = store();
        assert!(store.compare_and_set("main", None, "old").expect("seed"));
        let store = Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.compare_and_set("main", Some("old"), "new"))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().expect("join").expect("cas"))
            .filter(|won| *won)
            .count();

        assert_eq!(wins, 1);
        assert_eq!(store.get("main").expect("get").as_deref(), Some("new"));
        assert_eq!(store.history("main").expect("history").len(), 2);
    }

    #[test]
    fn state_file_named_like_a_lock_file_still_works() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStateStore::new(temp.path().join("deploy.lock"));

        assert!(store.compare_and_set("main", None, "aaa").expect("cas"));
        assert_eq!(store.get("main").expect("get").as_deref(), Some("aaa"));
        assert!(temp.path().join("deploy.lock.lock").exists());
    }

    #[test]
    fn corrupted_file_is_an_error() {
        let (_temp, store) = store();
        fs::create_dir_all(store.path().parent().expect("parent")).expect("mkdir");
        fs::write(store.path(), "not json").expect("write");
        assert!(matches!(
            store.get("main"),
            Err(StateStoreError::Corrupted { .. })
        ));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let (_temp, store) = store();
        fs::create_dir_all(store.path().parent().expect("parent")).expect("mkdir");
        fs::write(store.path(), "{\"version\": 9, \"branches\": {}}").expect("write");
        assert!(matches!(
            store.get("main"),
            Err(StateStoreError::Version { found: 9, .. })
        ));
    }
}
