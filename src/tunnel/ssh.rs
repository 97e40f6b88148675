use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, TunnelError};
use crate::runner::resolve_executable;
use crate::tunnel::{
    BackendKind, BackendParams, BackendStatus, Endpoint, HandleInner, SshParams, TunnelHandle,
    TunnelSpec,
};

/// How long `close` waits for ssh to exit after SIGTERM.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Tunnel backed by an `ssh -N -L` child process.
pub struct ProcessTunnel {
    program: String,
    args: Vec<String>,
}

impl ProcessTunnel {
    pub fn from_spec(spec: &TunnelSpec) -> Result<Self> {
        let BackendParams::Ssh(params) = &spec.params else {
            return Err(TunnelError::invalid_spec(
                "ssh tunnel requires ssh user/host parameters",
            ));
        };
        if params.host.is_empty() {
            return Err(TunnelError::invalid_spec("ssh tunnel host is empty"));
        }

        Ok(Self {
            program: "ssh".to_string(),
            args: forward_args(&spec.local, &spec.remote, params),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_command(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub async fn open(&self) -> Result<TunnelHandle> {
        info!("Searching for {} binary", self.program);
        let path = resolve_executable(&self.program).ok_or_else(|| {
            TunnelError::backend_unavailable(format!(
                "{} binary is not available in PATH",
                self.program
            ))
        })?;

        info!(args = ?self.args(), "Opening SSH tunnel");
        let mut cmd = Command::new(&path);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // Own process group, so a Ctrl-C aimed at the client leaves the tunnel alone
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            TunnelError::spawn_failed(format!("failed to start {}: {}", self.program, e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| TunnelError::spawn_failed(format!("{} exited immediately", self.program)))?;

        let (status_tx, status_rx) = watch::channel(BackendStatus::Running);
        let program = self.program.clone();
        let waiter = tokio::spawn(async move {
            let cause = match child.wait().await {
                Ok(status) => format!("{} exited with {}", program, status),
                Err(e) => format!("failed to wait on {}: {}", program, e),
            };
            debug!(%cause, "Tunnel process finished");
            let _ = status_tx.send(BackendStatus::Failed(cause));
        });

        debug!(pid, "Tunnel process started");
        Ok(TunnelHandle::new(
            BackendKind::Ssh,
            HandleInner::Process(ProcessHandle {
                pid,
                waiter: Some(waiter),
            }),
            status_rx,
        ))
    }
}

/// Arguments for `ssh`: `-N [-o OPT]... -L local:remote login`.
pub fn forward_args(local: &Endpoint, remote: &Endpoint, params: &SshParams) -> Vec<String> {
    let mut args = vec!["-N".to_string()];
    for option in &params.options {
        args.push("-o".to_string());
        args.push(option.clone());
    }
    args.push("-L".to_string());
    args.push(format!(
        "{}:{}:{}:{}",
        bracket(&local.host),
        local.port,
        bracket(&remote.host),
        remote.port
    ));
    args.push(params.login());
    args
}

fn bracket(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

pub(crate) struct ProcessHandle {
    pid: u32,
    waiter: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    pub(crate) async fn close(&mut self) -> Result<()> {
        let Some(mut waiter) = self.waiter.take() else {
            return Ok(());
        };
        if waiter.is_finished() {
            debug!(pid = self.pid, "Tunnel process already exited");
            return Ok(());
        }

        info!(pid = self.pid, "Closing SSH tunnel");
        terminate_group(self.pid)?;

        match tokio::time::timeout(CLOSE_GRACE, &mut waiter).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(pid = self.pid, "SSH tunnel did not exit after SIGTERM");
                Err(TunnelError::close_failed(format!(
                    "ssh (pid {}) still running {}s after SIGTERM",
                    self.pid,
                    CLOSE_GRACE.as_secs()
                )))
            }
        }
    }

    pub(crate) fn terminate_now(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            if !waiter.is_finished() {
                let _ = terminate_group(self.pid);
            }
        }
    }
}

fn terminate_group(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(pid)
        .map_err(|_| TunnelError::close_failed(format!("invalid process id {}", pid)))?;
    match killpg(Pid::from_raw(pgid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(TunnelError::close_failed(format!(
            "failed to signal process group {}: {}",
            pgid, e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::Backend;

    fn scenario_spec() -> TunnelSpec {
        TunnelSpec {
            local: Endpoint::new("127.0.0.1", 5432),
            remote: Endpoint::new("db.internal", 5432),
            params: BackendParams::Ssh(SshParams {
                user: "user".into(),
                host: "bastion.example".into(),
                options: Vec::new(),
            }),
        }
    }

    #[test]
    fn test_forward_args() {
        let tunnel = ProcessTunnel::from_spec(&scenario_spec()).unwrap();
        assert_eq!(
            tunnel.args(),
            [
                "-N",
                "-L",
                "127.0.0.1:5432:db.internal:5432",
                "user@bastion.example"
            ]
        );
    }

    #[test]
    fn test_forward_args_with_options() {
        let params = SshParams {
            user: String::new(),
            host: "bastion".into(),
            options: vec!["ExitOnForwardFailure=yes".into()],
        };
        let args = forward_args(
            &Endpoint::new("::1", 6543),
            &Endpoint::new("10.0.0.5", 5432),
            &params,
        );
        assert_eq!(
            args,
            [
                "-N",
                "-o",
                "ExitOnForwardFailure=yes",
                "-L",
                "[::1]:6543:10.0.0.5:5432",
                "bastion"
            ]
        );
    }

    #[test]
    fn test_empty_host_rejected() {
        let mut spec = scenario_spec();
        spec.params = BackendParams::Ssh(SshParams {
            user: "root".into(),
            host: String::new(),
            options: Vec::new(),
        });
        assert!(ProcessTunnel::from_spec(&spec).is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let backend = Backend::Process(ProcessTunnel::with_command(
            "pgtun_nonexistent_binary_12345",
            &[],
        ));
        let err = backend.open(&scenario_spec()).await.err().unwrap();
        assert!(
            matches!(err, TunnelError::BackendUnavailable { .. }),
            "got: {}",
            err
        );
    }

    #[tokio::test]
    async fn test_close_terminates_process_and_is_idempotent() {
        let tunnel = ProcessTunnel::with_command("sleep", &["30"]);
        let mut handle = tunnel.open().await.unwrap();
        let mut status = handle.status();
        assert_eq!(*status.borrow(), BackendStatus::Running);

        handle.close().await.unwrap();
        assert!(handle.is_closed());

        // The waiter publishes the exit once the child is gone
        status
            .wait_for(|s| matches!(s, BackendStatus::Failed(_)))
            .await
            .unwrap();

        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_after_process_exited() {
        let tunnel = ProcessTunnel::with_command("true", &[]);
        let mut handle = tunnel.open().await.unwrap();
        let mut status = handle.status();
        status
            .wait_for(|s| matches!(s, BackendStatus::Failed(_)))
            .await
            .unwrap();

        handle.close().await.unwrap();
        handle.close().await.unwrap();
    }
}
