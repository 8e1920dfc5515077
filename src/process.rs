//! Process-group execution with timeouts.
//!
//! Every backend process is spawned as the leader of a fresh process group so
//! that a timeout (or an environment cleanup) can terminate the whole tree,
//! not just the leaf that was spawned. Live groups are tracked per
//! environment in a [`ProcessRegistry`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::RunnerError;

/// How long to wait for output pipes to drain after the group is gone.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Description of a process to launch.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    /// Creates a spec for `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
        }
    }

    /// Runs `script` through `sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").with_args(vec!["-c".to_string(), script.into()])
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Renders the command line for logging.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Output of a finished (or killed) process group.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Exit code of the group leader; `None` if it died from a signal.
    pub exit_code: Option<i32>,
    /// Terminating signal of the group leader, if any.
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Live process groups keyed by environment id.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    groups: Arc<Mutex<HashMap<String, u32>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `pgid` as the live process group of `env_id`.
    pub fn track(&self, env_id: &str, pgid: u32) {
        self.groups
            .lock()
            .expect("process registry lock poisoned")
            .insert(env_id.to_string(), pgid);
    }

    /// Forgets the process group of `env_id`.
    pub fn untrack(&self, env_id: &str) {
        self.groups
            .lock()
            .expect("process registry lock poisoned")
            .remove(env_id);
    }

    /// Returns the live process group of `env_id`, if any.
    pub fn get(&self, env_id: &str) -> Option<u32> {
        self.groups
            .lock()
            .expect("process registry lock poisoned")
            .get(env_id)
            .copied()
    }

    /// Kills and forgets the process group of `env_id`.
    ///
    /// Returns true if a group was tracked.
    pub fn kill(&self, env_id: &str) -> bool {
        let pgid = self
            .groups
            .lock()
            .expect("process registry lock poisoned")
            .remove(env_id);
        match pgid {
            Some(pgid) => {
                kill_process_group(pgid);
                true
            }
            None => false,
        }
    }
}

/// Sends SIGKILL to every process in group `pgid`.
#[cfg(unix)]
pub fn kill_process_group(pgid: u32) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(e) => {
            warn!(pgid = pgid, error = %e, "Failed to kill process group");
            false
        }
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pgid: u32) -> bool {
    false
}

/// Runs `spec` in its own process group, killing the group on timeout.
///
/// When `tracking` is given, the group is registered under that environment
/// id for the lifetime of the process.
pub async fn run_process_group(
    spec: &ProcessSpec,
    timeout: Duration,
    tracking: Option<(&ProcessRegistry, &str)>,
) -> Result<ProcessOutput, RunnerError> {
    let start = Instant::now();

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &spec.current_dir {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| RunnerError::Spawn {
        command: spec.display(),
        reason: e.to_string(),
    })?;

    let pgid = child.id();
    if let (Some(pgid), Some((registry, env_id))) = (pgid, tracking) {
        registry.track(env_id, pgid);
    }
    debug!(command = %spec.display(), pgid = ?pgid, "Spawned process group");

    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let waited = tokio::time::timeout(timeout, child.wait()).await;
    let (status, timed_out) = match waited {
        Ok(Ok(status)) => (Some(status), false),
        Ok(Err(e)) => {
            if let Some(pgid) = pgid {
                kill_process_group(pgid);
            }
            untrack(tracking);
            return Err(RunnerError::Execution(format!(
                "Failed to wait for '{}': {}",
                spec.display(),
                e
            )));
        }
        Err(_) => {
            warn!(
                command = %spec.display(),
                timeout_secs = timeout.as_secs_f64(),
                "Process group timed out, killing"
            );
            match pgid {
                Some(pgid) => {
                    kill_process_group(pgid);
                }
                None => {
                    let _ = child.start_kill();
                }
            }
            (child.wait().await.ok(), true)
        }
    };

    // Reap anything the leader left behind in its group.
    if let Some(pgid) = pgid {
        kill_process_group(pgid);
    }
    untrack(tracking);

    let stdout = drain_reader(stdout_reader).await;
    let stderr = drain_reader(stderr_reader).await;

    let exit_code = status.and_then(|s| s.code());
    let signal = status.and_then(exit_signal);

    Ok(ProcessOutput {
        exit_code: if timed_out { None } else { exit_code },
        signal,
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

fn untrack(tracking: Option<(&ProcessRegistry, &str)>) {
    if let Some((registry, env_id)) = tracking {
        registry.untrack(env_id);
    }
}

#[cfg(unix)]
fn exit_signal(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: std::process::ExitStatus) -> Option<i32> {
    None
}

fn spawn_reader<R>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Err(e) = pipe.read_to_end(&mut buf).await {
                debug!(error = %e, "Output pipe closed with error");
            }
            buf
        })
    })
}

async fn drain_reader(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).to_string(),
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader task failed");
            String::new()
        }
        Err(_) => {
            handle.abort();
            warn!("Output pipe still held open after process exit, dropping output");
            String::new()
        }
    }
}
