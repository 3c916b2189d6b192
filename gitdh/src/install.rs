//! Orchestration for `git-dh install postreceive` and `git-dh install cron`.
//!
//! Every target is resolved first; nothing is written unless all targets
//! resolve and every destination passes [`check_plan`].

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::instrument;

use crate::core::install::{CronEntry, render_cron_file, render_post_receive_hook};
use crate::io::config_resolver::resolve_config;
use crate::io::install::{InstallOptions, PlannedFile, apply_plan, check_plan};

/// Settings of `install cron` beyond the shared [`InstallOptions`].
#[derive(Debug, Clone)]
pub struct CronInstall {
    /// File name under `cron_dir`.
    pub name: String,
    /// Defaults to `$USER`, then `$LOGNAME`.
    pub user: Option<String>,
    pub mailto: String,
    /// Defaults to `$PATH`.
    pub unix_path: Option<String>,
    pub interval: String,
    pub cron_dir: PathBuf,
}

/// Install a post-receive hook into the repository of every target.
#[instrument(skip_all, fields(targets = targets.len()))]
pub fn install_post_receive(targets: &[PathBuf], options: &InstallOptions) -> Result<Vec<String>> {
    validate_options(targets, options)?;
    let mut files = Vec::new();
    for target in targets {
        let config = resolve_config(target)
            .with_context(|| format!("resolve configuration for {}", target.display()))?;
        let repository = config
            .repository_path()
            .with_context(|| format!("missing RepositoryPath for '{}'", target.display()))?;
        let absolute = std::path::absolute(target)
            .with_context(|| format!("absolute path of {}", target.display()))?;
        files.push(PlannedFile {
            path: hooks_dir(&repository).join("post-receive"),
            contents: render_post_receive_hook(&absolute.display().to_string()),
        });
    }
    check_plan(&files, options)?;
    apply_plan(&files, options)
}

/// Install one cron file polling every target.
#[instrument(skip_all, fields(name = %cron.name, targets = targets.len()))]
pub fn install_cron(
    cron: &CronInstall,
    targets: &[PathBuf],
    options: &InstallOptions,
) -> Result<Vec<String>> {
    validate_options(targets, options)?;
    if cron.name.is_empty() || cron.name.contains('/') {
        bail!("invalid cron job name '{}'", cron.name);
    }

    let mut absolute_targets = Vec::new();
    for target in targets {
        resolve_config(target)
            .with_context(|| format!("resolve configuration for {}", target.display()))?;
        let absolute = std::path::absolute(target)
            .with_context(|| format!("absolute path of {}", target.display()))?;
        absolute_targets.push(absolute.display().to_string());
    }

    let user = match &cron.user {
        Some(user) => user.clone(),
        None => env::var("USER")
            .or_else(|_| env::var("LOGNAME"))
            .context("can't determine the current user, pass --user")?,
    };
    let unix_path = cron
        .unix_path
        .clone()
        .unwrap_or_else(|| env::var("PATH").unwrap_or_default());

    let path = cron.cron_dir.join(&cron.name);
    let contents = render_cron_file(&CronEntry {
        path: path.display().to_string(),
        unix_path,
        mailto: cron.mailto.clone(),
        interval: cron.interval.clone(),
        user,
        targets: absolute_targets,
    });
    let files = vec![PlannedFile { path, contents }];
    check_plan(&files, options)?;
    apply_plan(&files, options)
}

fn validate_options(targets: &[PathBuf], options: &InstallOptions) -> Result<()> {
    if options.print_only && options.force {
        bail!("invalid options: --printOnly and --force both set");
    }
    if targets.is_empty() {
        bail!("please provide at least one target");
    }
    Ok(())
}

/// Hook directory of a bare or non-bare repository.
fn hooks_dir(repository: &Path) -> PathBuf {
    let dot_git = repository.join(".git");
    if dot_git.is_dir() {
        dot_git.join("hooks")
    } else {
        repository.join("hooks")
    }
}
