//! Resolve a [`Configuration`] from a command-line target.
//!
//! A target is either a configuration file or a repository directory whose
//! `gitdh` branch carries a `gitdh.conf`. Resolution only reads.

use std::fs;
use std::path::Path;

use tracing::{debug, instrument};

use crate::core::config::{Configuration, GIT_SECTION, KEY_REPOSITORY_PATH};
use crate::error::ConfigError;
use crate::io::git::{Git, GitQuery};

/// Branch holding the in-repository configuration.
pub const CONFIG_BRANCH: &str = "gitdh";
/// File on [`CONFIG_BRANCH`] holding the configuration.
pub const CONFIG_FILE: &str = "gitdh.conf";

/// Resolve `path` using the git CLI for repository targets.
pub fn resolve_config(path: &Path) -> Result<Configuration, ConfigError> {
    resolve_config_with(path, |dir: &Path| Git::new(dir))
}

/// Resolve `path`, building the [`GitQuery`] for directory targets with `open_repo`.
#[instrument(skip_all, fields(target = %path.display()))]
pub fn resolve_config_with<G, F>(path: &Path, open_repo: F) -> Result<Configuration, ConfigError>
where
    G: GitQuery,
    F: FnOnce(&Path) -> G,
{
    let config = if path.is_file() {
        from_file(path)?
    } else if path.is_dir() {
        from_repository(path, &open_repo(path))?
    } else {
        return Err(ConfigError::InvalidPath {
            path: path.to_path_buf(),
        });
    };

    if config.repository_path().is_none() {
        return Err(ConfigError::MissingRepositoryPath {
            origin: config.origin().to_string(),
        });
    }
    Ok(config)
}

/// Parse a configuration file.
pub fn from_file(path: &Path) -> Result<Configuration, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "parsing configuration file");
    Configuration::parse(&text, &path.display().to_string())
}

/// Read `gitdh.conf` from the `gitdh` branch of the repository at `repo`.
///
/// `RepositoryPath` defaults to `repo` when the file does not set it.
pub fn from_repository<G: GitQuery>(repo: &Path, git: &G) -> Result<Configuration, ConfigError> {
    let branches = git.list_branches()?;
    if !branches.iter().any(|b| b == CONFIG_BRANCH) {
        return Err(ConfigError::MissingConfigBranch {
            repo: repo.to_path_buf(),
        });
    }

    let content = git
        .file_content_at(CONFIG_BRANCH, CONFIG_FILE)?
        .ok_or_else(|| ConfigError::MissingConfigFile {
            repo: repo.to_path_buf(),
        })?;
    let origin = format!("{}@{CONFIG_BRANCH}:{CONFIG_FILE}", repo.display());
    let text = String::from_utf8(content).map_err(|source| ConfigError::NotUtf8 {
        origin: origin.clone(),
        source,
    })?;
    let mut config = Configuration::parse(&text, &origin)?;

    if config.repository_path().is_none() {
        debug!(repo = %repo.display(), "defaulting RepositoryPath to target directory");
        config.set(GIT_SECTION, KEY_REPOSITORY_PATH, &repo.display().to_string());
    }
    Ok(config)
}
