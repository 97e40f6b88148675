//! Runs the interactive client program in the foreground.

use std::env;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::{Result, TunnelError};
use crate::signals::Interrupts;

/// How long the client gets to exit after a forwarded termination signal.
const SIGNAL_GRACE: Duration = Duration::from_secs(5);

/// The client command, already pointed at the tunnel's local endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub program: String,
    pub args: Vec<String>,
}

impl Workload {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// Standard streams handed to the client.
pub struct WorkloadStdio {
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
}

impl WorkloadStdio {
    /// Wire the client straight to this process's terminal.
    pub fn inherit() -> Self {
        Self {
            stdin: Stdio::inherit(),
            stdout: Stdio::inherit(),
            stderr: Stdio::inherit(),
        }
    }

    #[cfg(test)]
    pub fn null() -> Self {
        Self {
            stdin: Stdio::null(),
            stdout: Stdio::null(),
            stderr: Stdio::null(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited(i32),
    Signaled(i32),
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ProcessOutcome::Exited(0))
    }

    /// Exit code to report as our own, 128 + signal for a killed client.
    pub fn exit_code(&self) -> u8 {
        match self {
            ProcessOutcome::Exited(code) => u8::try_from(*code).unwrap_or(1),
            ProcessOutcome::Signaled(signal) => u8::try_from(128 + signal).unwrap_or(1),
        }
    }
}

impl From<ExitStatus> for ProcessOutcome {
    fn from(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        if let Some(code) = status.code() {
            return ProcessOutcome::Exited(code);
        }
        match status.signal() {
            Some(signal) => ProcessOutcome::Signaled(signal),
            None => ProcessOutcome::Exited(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Spawn `workload` and wait for it to exit.
    ///
    /// SIGINT stays with the client. SIGTERM or SIGHUP is passed on to it,
    /// and the run ends as `Interrupted` once the client has gone (or been
    /// killed after [`SIGNAL_GRACE`]). The child is also killed if the
    /// returned future is dropped before it exits.
    pub async fn run(
        &self,
        workload: &Workload,
        stdio: WorkloadStdio,
        interrupts: &mut Interrupts,
    ) -> Result<ProcessOutcome> {
        info!("Searching for {} binary", workload.program);
        let path = resolve_executable(&workload.program).ok_or_else(|| {
            TunnelError::ExecutableNotFound {
                program: workload.program.clone(),
            }
        })?;

        info!(args = ?workload.args, "Start {}", workload.program);
        let mut child = Command::new(&path)
            .args(&workload.args)
            .stdin(stdio.stdin)
            .stdout(stdio.stdout)
            .stderr(stdio.stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TunnelError::spawn_failed(format!("failed to launch {}: {}", workload.program, e))
            })?;

        let status = tokio::select! {
            status = child.wait() => status,
            signal = interrupts.recv(false) => {
                forward_signal(&mut child, &workload.program, signal).await;
                return Err(TunnelError::Interrupted { signal });
            }
        };
        let status = status.map_err(|e| {
            TunnelError::spawn_failed(format!("failed to wait on {}: {}", workload.program, e))
        })?;
        let outcome = ProcessOutcome::from(status);
        info!(?outcome, "{} exited", workload.program);
        Ok(outcome)
    }
}

async fn forward_signal(child: &mut Child, program: &str, signal: i32) {
    let target = child.id().and_then(|pid| i32::try_from(pid).ok());
    if let (Some(pid), Ok(sig)) = (target, Signal::try_from(signal)) {
        info!(signal = %sig, "Passing signal to {}", program);
        if let Err(e) = kill(Pid::from_raw(pid), sig) {
            warn!("Failed to signal {}: {}", program, e);
        }
    }

    match tokio::time::timeout(SIGNAL_GRACE, child.wait()).await {
        Ok(status) => info!(?status, "{} exited after signal", program),
        Err(_) => {
            warn!("{} still running after signal, killing it", program);
            let _ = child.kill().await;
        }
    }
}

/// Locate `program` the way a shell would: paths are taken as given,
/// bare names are searched in `PATH`.
pub fn resolve_executable(program: &str) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }
    if program.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }

    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
