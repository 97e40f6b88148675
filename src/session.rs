//! One tunnel session: open the backend, wait for readiness, run the client,
//! and close the tunnel on every way out.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Result, TunnelError};
use crate::probe::{Readiness, ReadinessProbe};
use crate::runner::{ProcessOutcome, ProcessRunner, Workload, WorkloadStdio};
use crate::signals::Interrupts;
use crate::tunnel::{BackendKind, BackendRegistry, TunnelHandle, TunnelSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    AwaitingReady,
    Ready,
    Running,
    Closing,
    Closed,
    Failed,
}

pub struct TunnelSession {
    registry: Arc<BackendRegistry>,
    kind: BackendKind,
    spec: TunnelSpec,
    probe: ReadinessProbe,
    runner: ProcessRunner,
    state: SessionState,
    history: Vec<SessionState>,
    readiness: Option<Readiness>,
    close_error: Option<TunnelError>,
}

impl TunnelSession {
    pub fn new(
        registry: Arc<BackendRegistry>,
        kind: BackendKind,
        spec: TunnelSpec,
        probe: ReadinessProbe,
    ) -> Self {
        Self {
            registry,
            kind,
            spec,
            probe,
            runner: ProcessRunner,
            state: SessionState::Idle,
            history: vec![SessionState::Idle],
            readiness: None,
            close_error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state the session has been in, in order.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    pub fn readiness(&self) -> Option<&Readiness> {
        self.readiness.as_ref()
    }

    /// The error from closing the tunnel, if teardown did not go cleanly.
    pub fn close_error(&self) -> Option<&TunnelError> {
        self.close_error.as_ref()
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    /// Run the whole session once.
    ///
    /// A client exit of any status is `Ok`; errors mean the client never ran
    /// to completion. Whenever the backend produced a handle, it has been
    /// closed exactly once by the time this returns.
    pub async fn run(
        &mut self,
        workload: &Workload,
        stdio: WorkloadStdio,
        interrupts: &mut Interrupts,
    ) -> Result<ProcessOutcome> {
        if self.state != SessionState::Idle {
            return Err(TunnelError::invalid_spec(
                "a tunnel session can only be run once",
            ));
        }

        self.transition(SessionState::Connecting);
        info!(backend = %self.kind, local = %self.spec.local, "Connecting to tunnel");
        let opened = match self.registry.create(self.kind, &self.spec) {
            Ok(backend) => {
                debug!(backend = %backend.kind(), "Backend created");
                tokio::select! {
                    opened = backend.open(&self.spec) => opened,
                    signal = interrupts.recv(true) => Err(TunnelError::Interrupted { signal }),
                }
            }
            Err(e) => Err(e),
        };
        let mut handle = match opened {
            Ok(handle) => handle,
            Err(e) => {
                self.transition(SessionState::Failed);
                return Err(e);
            }
        };

        let result = self.drive(&handle, workload, stdio, interrupts).await;

        self.transition(SessionState::Closing);
        if let Err(e) = handle.close().await {
            warn!("Closing tunnel failed: {}", e);
            self.close_error = Some(e);
        }
        self.transition(match result {
            Ok(_) => SessionState::Closed,
            Err(_) => SessionState::Failed,
        });

        result
    }

    async fn drive(
        &mut self,
        handle: &TunnelHandle,
        workload: &Workload,
        stdio: WorkloadStdio,
        interrupts: &mut Interrupts,
    ) -> Result<ProcessOutcome> {
        self.transition(SessionState::AwaitingReady);
        let readiness = tokio::select! {
            readiness = self.probe.wait_ready(&self.spec.local, handle.status()) => readiness,
            signal = interrupts.recv(true) => return Err(TunnelError::Interrupted { signal }),
        };
        self.readiness = Some(readiness.clone());

        match readiness {
            Readiness::Ready { attempts } => {
                debug!(attempts, "Tunnel ready");
            }
            Readiness::Timeout { attempts } => {
                warn!("Tunnel connection timeout. Exiting.");
                return Err(TunnelError::ReadinessTimeout {
                    address: self.spec.local.to_string(),
                    attempts,
                });
            }
            Readiness::BackendFailed(cause) => {
                return Err(TunnelError::backend_failed(cause));
            }
        }
        self.transition(SessionState::Ready);

        self.transition(SessionState::Running);
        self.runner.run(workload, stdio, interrupts).await
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "Session state");
        self.state = next;
        self.history.push(next);
    }
}
