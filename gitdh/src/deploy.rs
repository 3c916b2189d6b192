//! Deployment executor: run a branch's commands and commit the outcome.
//!
//! Branches are deployed independently on a bounded worker pool. Commands
//! for one branch run in order under a shared time budget; the state store
//! is advanced with compare-and-set only after every command succeeded, so a
//! failed or interrupted deployment is retried by the next trigger.

use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

use crate::core::budget::{deadline_after, remaining_budget};
use crate::core::config::{BranchRule, InitialDeploy, RewritePolicy};
use crate::core::exec_env::ExecEnv;
use crate::core::types::{DeployOutcome, DeploymentRecord, RevisionEvent};
use crate::error::{ExecutionError, StateStoreError};
use crate::io::executor::{DEFAULT_OUTPUT_LIMIT_BYTES, ExecRequest, Executor};
use crate::io::state_store::StateStore;
use crate::pool::{DEFAULT_WORKERS, map_bounded};

/// Configuration for a deployment pass.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    /// Branches deployed concurrently.
    pub workers: usize,
    /// Truncate captured command output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

/// Why an event was not acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No branch section matches the event's branch.
    Unconfigured,
    /// The stored revision already equals the new revision.
    AlreadyDeployed,
    /// Another invocation advanced the branch first.
    LostRace,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::Unconfigured => "unconfigured",
            SkipReason::AlreadyDeployed => "already-deployed",
            SkipReason::LostRace => "lost-race",
        }
    }
}

/// Final state of one branch in a deployment pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchOutcome {
    Deployed,
    Baseline,
    Failed(String),
    Refused,
    Skipped(SkipReason),
}

impl BranchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchOutcome::Deployed => "deployed",
            BranchOutcome::Baseline => "baseline",
            BranchOutcome::Failed(_) => "failed",
            BranchOutcome::Refused => "refused",
            BranchOutcome::Skipped(_) => "skipped",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, BranchOutcome::Failed(_) | BranchOutcome::Refused)
    }
}

/// Per-branch result with the captured command output.
#[derive(Debug, Clone)]
pub struct BranchReport {
    pub event: RevisionEvent,
    pub outcome: BranchOutcome,
    pub output: String,
}

impl BranchReport {
    fn new(event: &RevisionEvent, outcome: BranchOutcome) -> Self {
        Self {
            event: event.clone(),
            outcome,
            output: String::new(),
        }
    }

    pub fn branch(&self) -> &str {
        self.event.branch()
    }
}

/// Reports for every event of a pass, in event order.
#[derive(Debug, Clone, Default)]
pub struct DeploymentSummary {
    pub reports: Vec<BranchReport>,
}

impl DeploymentSummary {
    pub fn is_success(&self) -> bool {
        !self.reports.iter().any(|r| r.outcome.is_failure())
    }

    pub fn failures(&self) -> impl Iterator<Item = &BranchReport> {
        self.reports.iter().filter(|r| r.outcome.is_failure())
    }
}

/// Deploys revision events for one repository.
pub struct Deployer<'a, S: ?Sized, E: ?Sized> {
    store: &'a S,
    executor: &'a E,
    repository: PathBuf,
    config: DeployConfig,
}

impl<'a, S, E> Deployer<'a, S, E>
where
    S: StateStore + ?Sized,
    E: Executor + ?Sized,
{
    pub fn new(store: &'a S, executor: &'a E, repository: &Path, config: DeployConfig) -> Self {
        Self {
            store,
            executor,
            repository: repository.to_path_buf(),
            config,
        }
    }

    /// Deploy every event; a state store failure aborts the pass once
    /// in-flight branches have finished.
    #[instrument(skip_all, fields(events = events.len(), workers = self.config.workers))]
    pub fn deploy(
        &self,
        events: &[RevisionEvent],
        rules: &[BranchRule],
    ) -> Result<DeploymentSummary, StateStoreError> {
        let results = map_bounded(events, self.config.workers, |event| {
            self.deploy_branch(event, rules)
        });
        let reports = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok(DeploymentSummary { reports })
    }

    #[instrument(skip_all, fields(branch = event.branch(), new = event.new_revision()))]
    fn deploy_branch(
        &self,
        event: &RevisionEvent,
        rules: &[BranchRule],
    ) -> Result<BranchReport, StateStoreError> {
        let Some(rule) = rules.iter().find(|r| r.branch == event.branch()) else {
            info!("branch is not configured");
            return Ok(BranchReport::new(
                event,
                BranchOutcome::Skipped(SkipReason::Unconfigured),
            ));
        };

        let stored = self.store.get(event.branch())?;
        if stored.as_deref() == Some(event.new_revision()) {
            info!("revision already deployed");
            return Ok(BranchReport::new(
                event,
                BranchOutcome::Skipped(SkipReason::AlreadyDeployed),
            ));
        }

        if stored.as_deref() != event.old_revision() {
            info!(
                stored = ?stored,
                expected = ?event.old_revision(),
                "state moved since the event was produced"
            );
            return Ok(BranchReport::new(
                event,
                BranchOutcome::Skipped(SkipReason::LostRace),
            ));
        }

        if event.rewritten() && rule.on_rewrite == RewritePolicy::Refuse {
            warn!("refusing non-fast-forward transition");
            self.store.record(
                DeploymentRecord::now(event.branch(), event.new_revision(), DeployOutcome::Refused)
                    .with_message(format!(
                        "{} is not an ancestor of {}",
                        event.old_revision_or_null(),
                        event.new_revision()
                    )),
            )?;
            return Ok(BranchReport::new(event, BranchOutcome::Refused));
        }

        if event.old_revision().is_none() && rule.initial_deploy == InitialDeploy::Skip {
            let record =
                DeploymentRecord::now(event.branch(), event.new_revision(), DeployOutcome::Baseline);
            let outcome = if self.store.compare_and_set_record(None, record)? {
                info!("recorded baseline without deploying");
                BranchOutcome::Baseline
            } else {
                BranchOutcome::Skipped(SkipReason::LostRace)
            };
            return Ok(BranchReport::new(event, outcome));
        }

        let (output, result) = self.run_commands(event, rule);
        if let Err(err) = result {
            let message = err.to_string();
            warn!(err = %message, "deployment failed");
            self.store.record(
                DeploymentRecord::now(event.branch(), event.new_revision(), DeployOutcome::Failed)
                    .with_message(message.clone()),
            )?;
            return Ok(BranchReport {
                event: event.clone(),
                outcome: BranchOutcome::Failed(message),
                output,
            });
        }

        let mut record =
            DeploymentRecord::now(event.branch(), event.new_revision(), DeployOutcome::Deployed);
        if event.rewritten() {
            record = record.with_message("history rewritten");
        }
        let outcome = if self.store.compare_and_set_record(event.old_revision(), record)? {
            info!("deployed");
            BranchOutcome::Deployed
        } else {
            info!(expected = ?event.old_revision(), "state moved during deployment, not recording");
            BranchOutcome::Skipped(SkipReason::LostRace)
        };
        Ok(BranchReport {
            event: event.clone(),
            outcome,
            output,
        })
    }

    /// Run the rule's commands in order, stopping at the first failure.
    fn run_commands(
        &self,
        event: &RevisionEvent,
        rule: &BranchRule,
    ) -> (String, Result<(), ExecutionError>) {
        let deadline = deadline_after(rule.timeout);
        let env = ExecEnv::for_deployment(&self.repository.display().to_string(), event);
        let mut output = String::new();

        for command in &rule.commands {
            let Some(timeout) = remaining_budget(deadline) else {
                return (
                    output,
                    Err(ExecutionError::TimedOut {
                        command: command.clone(),
                        timeout_secs: rule.timeout.as_secs(),
                    }),
                );
            };
            let outcome = self.executor.exec(&ExecRequest {
                command: command.clone(),
                workdir: rule.workdir.clone(),
                env: env.clone(),
                timeout,
                output_limit_bytes: self.config.output_limit_bytes,
            });
            output.push_str(&outcome.output);
            if outcome.result.is_err() {
                return (output, outcome.result);
            }
        }
        (output, Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Configuration;
    use crate::core::exec_env::{VAR_NEWREV, VAR_OLDREV, VAR_REWRITTEN};
    use crate::core::types::NULL_REVISION;
    use crate::source::{PushSource, RevisionSource};
    use crate::test_support::{FakeGit, MemoryStateStore, ScriptedExecutor};

    const CONFIG: &str = "\
[Git]
RepositoryPath = /srv/site

[main]
Command = build-main
    restart-main

[staging]
Command = deploy-staging
InitialDeploy = skip

[legacy]
Command = deploy-legacy
OnRewrite = refuse
";

    fn rules() -> Vec<BranchRule> {
        Configuration::parse(CONFIG, "test.conf")
            .expect("parse")
            .branch_rules()
            .expect("rules")
    }

    fn event(branch: &str, old: Option<&str>, new: &str) -> RevisionEvent {
        RevisionEvent::new(branch, old.map(str::to_string), new).expect("event")
    }

    fn deployer<'a>(
        store: &'a MemoryStateStore,
        executor: &'a ScriptedExecutor,
    ) -> Deployer<'a, MemoryStateStore, ScriptedExecutor> {
        Deployer::new(store, executor, Path::new("/srv/site"), DeployConfig::default())
    }

    #[test]
    fn successful_deploy_runs_commands_in_order_and_advances_state() {
        let store = MemoryStateStore::new();
        let executor = ScriptedExecutor::new();
        let summary = deployer(&store, &executor)
            .deploy(&[event("main", None, "m1")], &rules())
            .expect("deploy");

        assert!(summary.is_success());
        assert_eq!(summary.reports[0].outcome, BranchOutcome::Deployed);
        assert_eq!(
            executor.executed(),
            vec![
                ("main".to_string(), "build-main".to_string()),
                ("main".to_string(), "restart-main".to_string()),
            ]
        );
        assert!(summary.reports[0].output.contains("restart-main ok"));
        assert_eq!(store.get("main").expect("get").as_deref(), Some("m1"));
    }

    #[test]
    fn commands_receive_deployment_environment() {
        let store = MemoryStateStore::new();
        let executor = ScriptedExecutor::new();
        deployer(&store, &executor)
            .deploy(&[event("main", None, "m1")], &rules())
            .expect("deploy");

        let request = &executor.requests()[0];
        assert_eq!(request.env.get(VAR_OLDREV), Some(NULL_REVISION));
        assert_eq!(request.env.get(VAR_NEWREV), Some("m1"));
        assert_eq!(request.env.get(VAR_REWRITTEN), Some("0"));
        assert!(request.env.removes("GIT_DIR"));
        assert_eq!(request.workdir, PathBuf::from("/srv/site"));
    }

    #[test]
    fn failure_stops_remaining_commands_and_keeps_state() {
        let store = MemoryStateStore::new();
        store.compare_and_set("main", None, "m0").expect("seed");
        let executor = ScriptedExecutor::new().failing("build-main");

        let summary = deployer(&store, &executor)
            .deploy(&[event("main", Some("m0"), "m1")], &rules())
            .expect("deploy");

        assert!(!summary.is_success());
        assert!(matches!(summary.reports[0].outcome, BranchOutcome::Failed(_)));
        assert_eq!(executor.executed().len(), 1);
        assert_eq!(store.get("main").expect("get").as_deref(), Some("m0"));
        let history = store.history("main").expect("history");
        assert_eq!(history.last().map(|r| r.outcome), Some(DeployOutcome::Failed));
    }

    #[test]
    fn failing_branch_does_not_block_siblings() {
        let store = MemoryStateStore::new();
        let executor = ScriptedExecutor::new().failing("build-main");
        let rules: Vec<_> = rules()
            .into_iter()
            .map(|mut rule| {
                rule.initial_deploy = InitialDeploy::Deploy;
                rule
            })
            .collect();

        let summary = deployer(&store, &executor)
            .deploy(
                &[event("main", None, "m1"), event("staging", None, "s1")],
                &rules,
            )
            .expect("deploy");

        assert!(!summary.is_success());
        assert_eq!(summary.reports[1].outcome, BranchOutcome::Deployed);
        assert_eq!(store.get("main").expect("get"), None);
        assert_eq!(store.get("staging").expect("get").as_deref(), Some("s1"));
        let failed: Vec<_> = summary.failures().map(|r| r.branch()).collect();
        assert_eq!(failed, vec!["main"]);
    }

    #[test]
    fn unconfigured_and_already_deployed_branches_are_skipped() {
        let store = MemoryStateStore::new();
        store.compare_and_set("main", None, "m1").expect("seed");
        let executor = ScriptedExecutor::new();

        let summary = deployer(&store, &executor)
            .deploy(
                &[event("feature", None, "f1"), event("main", Some("m0"), "m1")],
                &rules(),
            )
            .expect("deploy");

        assert!(summary.is_success());
        assert_eq!(
            summary.reports[0].outcome,
            BranchOutcome::Skipped(SkipReason::Unconfigured)
        );
        assert_eq!(
            summary.reports[1].outcome,
            BranchOutcome::Skipped(SkipReason::AlreadyDeployed)
        );
        assert!(executor.executed().is_empty());
    }

    #[test]
    fn initial_skip_records_baseline_without_running() {
        let store = MemoryStateStore::new();
        let executor = ScriptedExecutor::new();

        let summary = deployer(&store, &executor)
            .deploy(&[event("staging", None, "s1")], &rules())
            .expect("deploy");

        assert_eq!(summary.reports[0].outcome, BranchOutcome::Baseline);
        assert!(executor.executed().is_empty());
        assert_eq!(store.get("staging").expect("get").as_deref(), Some("s1"));

        let summary = deployer(&store, &executor)
            .deploy(&[event("staging", Some("s1"), "s2")], &rules())
            .expect("deploy");
        assert_eq!(summary.reports[0].outcome, BranchOutcome::Deployed);
        assert_eq!(executor.executed().len(), 1);
    }

    #[test]
    fn rewrite_is_deployed_and_flagged_by_default() {
        let store = MemoryStateStore::new();
        store.compare_and_set("main", None, "m1").expect("seed");
        let executor = ScriptedExecutor::new();

        let rewrite = event("main", Some("m1"), "x1").flag_rewritten();
        let summary = deployer(&store, &executor)
            .deploy(&[rewrite], &rules())
            .expect("deploy");

        assert_eq!(summary.reports[0].outcome, BranchOutcome::Deployed);
        assert_eq!(executor.requests()[0].env.get(VAR_REWRITTEN), Some("1"));
        let history = store.history("main").expect("history");
        assert_eq!(
            history.last().and_then(|r| r.message.as_deref()),
            Some("history rewritten")
        );
    }

    #[test]
    fn rewrite_can_be_refused() {
        let store = MemoryStateStore::new();
        store.compare_and_set("legacy", None, "l1").expect("seed");
        let executor = ScriptedExecutor::new();

        let rewrite = event("legacy", Some("l1"), "x1").flag_rewritten();
        let summary = deployer(&store, &executor)
            .deploy(&[rewrite], &rules())
            .expect("deploy");

        assert_eq!(summary.reports[0].outcome, BranchOutcome::Refused);
        assert!(!summary.is_success());
        assert!(executor.executed().is_empty());
        assert_eq!(store.get("legacy").expect("get").as_deref(), Some("l1"));
    }

    #[test]
    fn stale_event_is_skipped_without_running() {
        let store = MemoryStateStore::new();
        store.compare_and_set("main", None, "m5").expect("seed");
        let executor = ScriptedExecutor::new();

        let summary = deployer(&store, &executor)
            .deploy(&[event("main", Some("m4"), "m6")], &rules())
            .expect("deploy");

        assert!(summary.is_success());
        assert_eq!(
            summary.reports[0].outcome,
            BranchOutcome::Skipped(SkipReason::LostRace)
        );
        assert!(executor.executed().is_empty());
        assert_eq!(store.get("main").expect("get").as_deref(), Some("m5"));
    }

    #[test]
    fn lagging_push_deploys_once_and_advances_state() {
        let git = FakeGit::new();
        let store = MemoryStateStore::new();
        store.compare_and_set("main", None, "a1").expect("seed");
        let executor = ScriptedExecutor::new();

        let pushed = PushSource::new(&git, &store, "b1", "c1", "refs/heads/main")
            .produce_events()
            .expect("events");
        let summary = deployer(&store, &executor)
            .deploy(&pushed.events, &rules())
            .expect("deploy");
        assert_eq!(summary.reports[0].outcome, BranchOutcome::Deployed);
        assert_eq!(store.get("main").expect("get").as_deref(), Some("c1"));

        // A later sweep over the same tip runs nothing.
        let swept = event("main", Some("a1"), "c1");
        let summary = deployer(&store, &executor)
            .deploy(&[swept], &rules())
            .expect("deploy");
        assert_eq!(
            summary.reports[0].outcome,
            BranchOutcome::Skipped(SkipReason::AlreadyDeployed)
        );
        assert_eq!(executor.executed().len(), 2);
    }

    #[test]
    fn push_only_history_keeps_advancing() {
        let git = FakeGit::new();
        let store = MemoryStateStore::new();
        let executor = ScriptedExecutor::new();

        for (old, new) in [("c1", "c2"), ("c2", "c3"), ("c3", "c4")] {
            let pushed = PushSource::new(&git, &store, old, new, "refs/heads/main")
                .produce_events()
                .expect("events");
            let summary = deployer(&store, &executor)
                .deploy(&pushed.events, &rules())
                .expect("deploy");
            assert_eq!(summary.reports[0].outcome, BranchOutcome::Deployed);
            assert_eq!(store.get("main").expect("get").as_deref(), Some(new));
        }
    }

    #[test]
    fn unwritable_store_aborts() {
        let store = MemoryStateStore::unwritable();
        let executor = ScriptedExecutor::new();
        let result = deployer(&store, &executor).deploy(&[event("main", None, "m1")], &rules());
        assert!(matches!(result, Err(StateStoreError::Io { .. })));
    }

    #[test]
    fn huge_timeout_still_deploys() {
        let store = MemoryStateStore::new();
        let executor = ScriptedExecutor::new();
        let mut rules = rules();
        rules[0].timeout = std::time::Duration::from_secs(u64::MAX);

        let summary = deployer(&store, &executor)
            .deploy(&[event("main", None, "m1")], &rules)
            .expect("deploy");
        assert_eq!(summary.reports[0].outcome, BranchOutcome::Deployed);
        assert!(executor.requests()[0].timeout <= crate::core::budget::MAX_BUDGET);
    }

    #[test]
    fn exhausted_budget_times_out_remaining_commands() {
        let store = MemoryStateStore::new();
        let executor = ScriptedExecutor::new();
        let mut rules = rules();
        rules[0].timeout = std::time::Duration::ZERO;

        let summary = deployer(&store, &executor)
            .deploy(&[event("main", None, "m1")], &rules)
            .expect("deploy");
        assert!(matches!(
            summary.reports[0].outcome,
            BranchOutcome::Failed(ref m) if m.contains("timed out")
        ));
        assert!(executor.executed().is_empty());
    }
}
