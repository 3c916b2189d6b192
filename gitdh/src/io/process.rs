//! Shell runner for deployment commands: explicit environment, timeout and
//! bounded output capture.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, ScopedJoinHandle};
use std::time::Duration;

use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::exec_env::ExecEnv;
use crate::error::ExecutionError;

/// Apply `env` to a command about to be spawned.
pub fn apply_env(cmd: &mut Command, env: &ExecEnv) {
    for key in env.removed() {
        cmd.env_remove(key);
    }
    cmd.envs(env.vars());
}

/// Bytes kept from one output stream and how many were dropped past the limit.
#[derive(Debug, Default)]
pub struct StreamCapture {
    pub bytes: Vec<u8>,
    pub dropped: usize,
}

impl StreamCapture {
    /// Read `reader` to the end, keeping at most `limit` bytes.
    fn drain<R: Read>(mut reader: R, limit: usize) -> std::io::Result<Self> {
        let mut capture = Self::default();
        let mut chunk = [0u8; 8192];
        loop {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                return Ok(capture);
            }
            let keep = n.min(limit.saturating_sub(capture.bytes.len()));
            capture.bytes.extend_from_slice(&chunk[..keep]);
            capture.dropped += n - keep;
        }
    }

    fn render_into(&self, out: &mut String, stream: &str) {
        out.push_str(&String::from_utf8_lossy(&self.bytes));
        if self.dropped > 0 {
            out.push_str(&format!("\n[{stream} truncated {} bytes]\n", self.dropped));
        }
    }
}

/// A shell command that exited or was killed.
#[derive(Debug)]
pub struct ShellRun {
    pub status: ExitStatus,
    pub stdout: StreamCapture,
    pub stderr: StreamCapture,
    pub timed_out: bool,
}

impl ShellRun {
    /// stdout then stderr, with truncation and timeout notices.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.stdout.render_into(&mut out, "stdout");
        self.stderr.render_into(&mut out, "stderr");
        if self.timed_out {
            out.push_str("\n[command timed out]\n");
        }
        out
    }
}

/// Run `line` with `sh -c` in `workdir`, killing it once `timeout` elapses.
///
/// Both pipes are drained while the child runs, so a chatty command never
/// stalls on a full pipe.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_shell(
    line: &str,
    workdir: &Path,
    env: &ExecEnv,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<ShellRun, ExecutionError> {
    let process_error = |message: String| ExecutionError::Process {
        command: line.to_string(),
        message,
    };

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(line)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    apply_env(&mut cmd, env);

    debug!("spawning shell");
    let mut child = cmd.spawn().map_err(|err| ExecutionError::Spawn {
        command: line.to_string(),
        workdir: workdir.to_path_buf(),
        message: err.to_string(),
    })?;
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        kill_quietly(&mut child);
        return Err(process_error("output was not piped".to_string()));
    };

    let (waited, stdout, stderr) = thread::scope(|scope| {
        let stdout = scope.spawn(move || StreamCapture::drain(stdout, output_limit_bytes));
        let stderr = scope.spawn(move || StreamCapture::drain(stderr, output_limit_bytes));
        let waited = wait_or_kill(&mut child, timeout);
        if waited.is_err() {
            // Readers return only once the child's pipes close.
            kill_quietly(&mut child);
        }
        (waited, join_capture(stdout), join_capture(stderr))
    });

    let (status, timed_out) = waited.map_err(|err| process_error(format!("wait: {err}")))?;
    let stdout = stdout.map_err(process_error)?;
    let stderr = stderr.map_err(process_error)?;
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "output truncated"
        );
    }
    debug!(exit_code = ?status.code(), timed_out, "shell finished");
    Ok(ShellRun {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

/// Exit status, and whether the child had to be killed.
fn wait_or_kill(child: &mut Child, timeout: Duration) -> std::io::Result<(ExitStatus, bool)> {
    if let Some(status) = child.wait_timeout(timeout)? {
        return Ok((status, false));
    }
    warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
    child.kill()?;
    Ok((child.wait()?, true))
}

fn kill_quietly(child: &mut Child) {
    if let Err(err) = child.kill() {
        warn!(err = %err, "can't kill command");
    }
}

fn join_capture(
    handle: ScopedJoinHandle<'_, std::io::Result<StreamCapture>>,
) -> Result<StreamCapture, String> {
    match handle.join() {
        Ok(Ok(capture)) => Ok(capture),
        Ok(Err(err)) => Err(format!("read output: {err}")),
        Err(_) => Err("output reader panicked".to_string()),
    }
}
