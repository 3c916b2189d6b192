//! Orchestration for `git-dh cron` and `git-dh postreceive`.
//!
//! Each target is resolved to a configuration, its revision source is asked
//! which branches moved, and the moved branches are handed to the
//! [`Deployer`]. Configuration and state store errors abort the invocation;
//! everything scoped to a branch ends up in the [`TargetReport`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::core::config::{BranchRule, Configuration};
use crate::deploy::{BranchOutcome, DeployConfig, Deployer, DeploymentSummary};
use crate::exit_codes;
use crate::io::config_resolver::resolve_config;
use crate::io::executor::{Executor, ShellExecutor};
use crate::io::git::Git;
use crate::io::state_store::{FileStateStore, StateStore};
use crate::source::{BranchFailure, PollSource, PushSource, RevisionSource};

/// One post-receive input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushLine {
    pub oldrev: String,
    pub newrev: String,
    pub refname: String,
}

/// Outcome of deploying one target.
#[derive(Debug, Clone)]
pub struct TargetReport {
    pub target: PathBuf,
    /// Branches whose revision could not be determined.
    pub check_failures: Vec<BranchFailure>,
    pub summary: DeploymentSummary,
}

impl TargetReport {
    pub fn is_success(&self) -> bool {
        self.check_failures.is_empty() && self.summary.is_success()
    }

    /// Stable `key=value` product lines, command output indented below its branch.
    pub fn lines(&self) -> Vec<String> {
        let target = self.target.display();
        let mut lines = Vec::new();
        for failure in &self.check_failures {
            lines.push(format!(
                "target={target} branch={} outcome=failed reason={:?}",
                failure.branch, failure.message
            ));
        }
        for report in &self.summary.reports {
            let event = &report.event;
            let mut line = format!(
                "target={target} branch={} outcome={} old={} new={} rewritten={}",
                event.branch(),
                report.outcome.as_str(),
                event.old_revision_or_null(),
                event.new_revision(),
                u8::from(event.rewritten()),
            );
            match &report.outcome {
                BranchOutcome::Skipped(reason) => {
                    line.push_str(&format!(" reason={}", reason.as_str()));
                }
                BranchOutcome::Failed(message) => {
                    line.push_str(&format!(" reason={message:?}"));
                }
                _ => {}
            }
            lines.push(line);
            lines.extend(report.output.lines().map(|l| format!("    {l}")));
        }
        lines
    }
}

/// Reports for every target of an invocation that was not aborted.
#[derive(Debug, Clone, Default)]
pub struct InvocationReport {
    pub targets: Vec<TargetReport>,
}

impl InvocationReport {
    pub fn exit_code(&self) -> i32 {
        if self.targets.iter().all(TargetReport::is_success) {
            exit_codes::OK
        } else {
            exit_codes::FAILED
        }
    }
}

/// Poll every target in order, calling `on_target` as soon as each finishes.
pub fn run_cron(
    targets: &[PathBuf],
    config: &DeployConfig,
    mut on_target: impl FnMut(&TargetReport),
) -> Result<InvocationReport> {
    let mut invocation = InvocationReport::default();
    for target in targets {
        let report = cron_target(target, config)?;
        on_target(&report);
        invocation.targets.push(report);
    }
    Ok(invocation)
}

/// Handle one post-receive line for `target`.
pub fn run_post_receive(
    target: &Path,
    line: &PushLine,
    config: &DeployConfig,
) -> Result<InvocationReport> {
    let resolved = Resolved::load(target)?;
    let git = Git::new(&resolved.repository);
    let source = PushSource::new(
        &git,
        &resolved.store,
        &line.oldrev,
        &line.newrev,
        &line.refname,
    );
    let report = deploy_target(
        target,
        &resolved.repository,
        &resolved.rules,
        &source,
        &resolved.store,
        &ShellExecutor,
        config,
    )?;
    Ok(InvocationReport {
        targets: vec![report],
    })
}

#[instrument(skip_all, fields(target = %target.display()))]
fn cron_target(target: &Path, config: &DeployConfig) -> Result<TargetReport> {
    let resolved = Resolved::load(target)?;
    let git = Git::new(&resolved.repository);
    let branches = resolved.rules.iter().map(|r| r.branch.clone()).collect();
    let source = PollSource::new(&git, &resolved.store, branches, config.workers);
    deploy_target(
        target,
        &resolved.repository,
        &resolved.rules,
        &source,
        &resolved.store,
        &ShellExecutor,
        config,
    )
}

/// Produce events from `source` and deploy them.
pub fn deploy_target<R, S, E>(
    target: &Path,
    repository: &Path,
    rules: &[BranchRule],
    source: &R,
    store: &S,
    executor: &E,
    config: &DeployConfig,
) -> Result<TargetReport>
where
    R: RevisionSource + ?Sized,
    S: StateStore + ?Sized,
    E: Executor + ?Sized,
{
    let sourced = source
        .produce_events()
        .with_context(|| format!("collect revision events for {}", target.display()))?;
    let summary = Deployer::new(store, executor, repository, config.clone())
        .deploy(&sourced.events, rules)
        .with_context(|| format!("deploy {}", target.display()))?;
    info!(
        events = summary.reports.len(),
        failed = summary.failures().count() + sourced.failures.len(),
        "target finished"
    );
    Ok(TargetReport {
        target: target.to_path_buf(),
        check_failures: sourced.failures,
        summary,
    })
}

/// Everything derived from a target's configuration.
struct Resolved {
    repository: PathBuf,
    rules: Vec<BranchRule>,
    store: FileStateStore,
}

impl Resolved {
    fn load(target: &Path) -> Result<Self> {
        let config = resolve_config(target)
            .with_context(|| format!("resolve configuration for {}", target.display()))?;
        Self::from_config(&config)
    }

    fn from_config(config: &Configuration) -> Result<Self> {
        let repository = config
            .repository_path()
            .with_context(|| format!("missing RepositoryPath in {}", config.origin()))?;
        let state_file = config
            .database_file()
            .with_context(|| format!("missing DatabaseFile in {}", config.origin()))?;
        let rules = config
            .branch_rules()
            .with_context(|| format!("invalid branch rules in {}", config.origin()))?;
        Ok(Self {
            repository,
            rules,
            store: FileStateStore::new(state_file),
        })
    }
}
