//! Error taxonomy for deployment invocations.
//!
//! Each enum maps to one failure scope:
//!
//! - [`ConfigError`] aborts the whole invocation.
//! - [`GitQueryError`] aborts the operation that needed git; during config
//!   resolution it surfaces as a [`ConfigError`], during a branch check it
//!   fails only that branch.
//! - [`ExecutionError`] is scoped to one branch and never aborts siblings.
//! - [`StateStoreError`] aborts the invocation. A lost compare-and-set is not
//!   an error at all.

use std::path::PathBuf;

use thiserror::Error;

/// Configuration could not be resolved.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("can't read config from '{}' (neither a file nor a directory)", path.display())]
    InvalidPath { path: PathBuf },

    #[error("no branch 'gitdh' in repository '{}'", repo.display())]
    MissingConfigBranch { repo: PathBuf },

    #[error("no file 'gitdh.conf' on branch 'gitdh' in repository '{}'", repo.display())]
    MissingConfigFile { repo: PathBuf },

    #[error("missing RepositoryPath for '{origin}'")]
    MissingRepositoryPath { origin: String },

    #[error("{origin}:{line}: {message}")]
    Parse {
        origin: String,
        line: usize,
        message: String,
    },

    #[error("invalid value '{value}' for '{key}' in section [{section}]: {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("branch section [{branch}] has no Command")]
    MissingCommand { branch: String },

    #[error("read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{origin}: configuration is not valid UTF-8")]
    NotUtf8 {
        origin: String,
        #[source]
        source: std::string::FromUtf8Error,
    },

    #[error("git query failed while resolving configuration: {0}")]
    Git(#[from] GitQueryError),
}

/// A git plumbing call failed.
#[derive(Error, Debug)]
pub enum GitQueryError {
    #[error("spawn git {args}: {source}")]
    Spawn {
        args: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {args} failed: {stderr}")]
    Failed { args: String, stderr: String },

    #[error("unknown branch '{branch}'")]
    UnknownBranch { branch: String },
}

/// A deployment command did not complete successfully.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("can't run '{command}' in {}: {message}", workdir.display())]
    Spawn {
        command: String,
        workdir: PathBuf,
        message: String,
    },

    #[error("'{command}' exited with status {code:?}")]
    Failed { command: String, code: Option<i32> },

    #[error("'{command}' timed out after {timeout_secs}s")]
    TimedOut { command: String, timeout_secs: u64 },

    #[error("run '{command}': {message}")]
    Process { command: String, message: String },
}

/// The durable state store is unusable.
#[derive(Error, Debug)]
pub enum StateStoreError {
    #[error("access state {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("lock state {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupted state {}: {source}", path.display())]
    Corrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported state version {found} in {} (expected {expected})", path.display())]
    Version {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_branch_message_names_repository() {
        let err = ConfigError::MissingConfigBranch {
            repo: PathBuf::from("/srv/git/site.git"),
        };
        assert_eq!(
            err.to_string(),
            "no branch 'gitdh' in repository '/srv/git/site.git'"
        );
    }

    #[test]
    fn git_errors_convert_into_config_errors() {
        let err: ConfigError = GitQueryError::UnknownBranch {
            branch: "gitdh".to_string(),
        }
        .into();
        assert!(err.to_string().contains("unknown branch 'gitdh'"));
    }
}
