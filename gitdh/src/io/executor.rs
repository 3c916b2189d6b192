//! Executor abstraction for deployment commands.
//!
//! The [`Executor`] trait decouples the deployment executor from actually
//! spawning shells. Tests use scripted executors that succeed or fail on
//! request without touching the system.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::exec_env::ExecEnv;
use crate::error::ExecutionError;
use crate::io::process::run_shell;

/// Default cap on captured stdout/stderr per command.
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

/// Parameters for one deployment command.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Shell command line, run with `sh -c`.
    pub command: String,
    /// Working directory for the command.
    pub workdir: PathBuf,
    /// Environment applied on top of the inherited one.
    pub env: ExecEnv,
    /// Maximum time to wait for the command to complete.
    pub timeout: Duration,
    /// Truncate captured output beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// What a command printed and whether it succeeded.
#[derive(Debug)]
pub struct ExecOutcome {
    pub output: String,
    pub result: Result<(), ExecutionError>,
}

impl ExecOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            result: Ok(()),
        }
    }

    pub fn failure(output: impl Into<String>, err: ExecutionError) -> Self {
        Self {
            output: output.into(),
            result: Err(err),
        }
    }
}

/// Abstraction over command execution backends.
pub trait Executor: Send + Sync {
    fn exec(&self, request: &ExecRequest) -> ExecOutcome;
}

/// Executor that runs commands through `sh -c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExecutor;

impl Executor for ShellExecutor {
    #[instrument(skip_all, fields(command = %request.command, timeout_secs = request.timeout.as_secs()))]
    fn exec(&self, request: &ExecRequest) -> ExecOutcome {
        if !request.workdir.is_dir() {
            return ExecOutcome::failure(
                "",
                ExecutionError::Spawn {
                    command: request.command.clone(),
                    workdir: request.workdir.clone(),
                    message: "working directory does not exist".to_string(),
                },
            );
        }
        info!(workdir = %request.workdir.display(), "running deployment command");

        let run = match run_shell(
            &request.command,
            &request.workdir,
            &request.env,
            request.timeout,
            request.output_limit_bytes,
        ) {
            Ok(run) => run,
            Err(err) => return ExecOutcome::failure("", err),
        };
        let rendered = run.render();

        if run.timed_out {
            warn!("deployment command timed out");
            return ExecOutcome::failure(
                rendered,
                ExecutionError::TimedOut {
                    command: request.command.clone(),
                    timeout_secs: request.timeout.as_secs(),
                },
            );
        }
        if !run.status.success() {
            warn!(exit_code = ?run.status.code(), "deployment command failed");
            return ExecOutcome::failure(
                rendered,
                ExecutionError::Failed {
                    command: request.command.clone(),
                    code: run.status.code(),
                },
            );
        }

        debug!("deployment command completed successfully");
        ExecOutcome::success(rendered)
    }
}
