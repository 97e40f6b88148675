//! Tunnel backends and the handle they produce.
//!
//! Two transports are supported:
//! - **ssh**: an external `ssh -N -L` process ([`ProcessTunnel`])
//! - **k8s**: the Kubernetes port-forward subresource ([`PortForwardTunnel`])
//!
//! Both expose the same two operations: [`Backend::open`] starts the
//! transport and returns a [`TunnelHandle`] without waiting for readiness,
//! and [`TunnelHandle::close`] tears it down idempotently.

pub mod portforward;
pub mod ssh;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{Result, TunnelError};

pub use portforward::PortForwardTunnel;
pub use ssh::ProcessTunnel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Port forward through an external ssh process
    #[default]
    #[value(alias = "process")]
    Ssh,
    /// Port forward through the Kubernetes API
    #[value(alias = "api")]
    K8s,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Ssh => write!(f, "ssh"),
            BackendKind::K8s => write!(f, "k8s"),
        }
    }
}

/// Kubernetes resources a port forward can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Pod,
    Service,
}

impl FromStr for ResourceKind {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pods" | "pod" | "po" => Ok(ResourceKind::Pod),
            "services" | "service" | "svc" => Ok(ResourceKind::Service),
            other => Err(TunnelError::invalid_spec(format!(
                "Unsupported resource type '{}'. Supported: pods, services",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshParams {
    /// Remote login, empty to let ssh pick
    pub user: String,
    /// Bastion host the tunnel goes through
    pub host: String,
    /// Extra `-o` options passed to ssh
    pub options: Vec<String>,
}

impl SshParams {
    pub fn login(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeParams {
    pub namespace: String,
    pub resource_kind: ResourceKind,
    pub resource_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendParams {
    Ssh(SshParams),
    Kube(KubeParams),
}

/// Everything needed to open one tunnel.
///
/// The local endpoint stays fixed for the lifetime of a session; the remote
/// fields are only interpreted by the backend that is selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub local: Endpoint,
    pub remote: Endpoint,
    pub params: BackendParams,
}

/// Health of a backend's transport as seen by its pump task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    Running,
    Failed(String),
}

/// The closed set of tunnel transports.
pub enum Backend {
    Process(ProcessTunnel),
    PortForward(PortForwardTunnel),
    #[cfg(test)]
    Fake(fake::FakeTunnel),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Process(_) => BackendKind::Ssh,
            Backend::PortForward(_) => BackendKind::K8s,
            #[cfg(test)]
            Backend::Fake(_) => BackendKind::Ssh,
        }
    }

    /// Start the transport. Returns as soon as it is started, not once it is
    /// ready; readiness is observed separately through the local endpoint.
    pub async fn open(&self, spec: &TunnelSpec) -> Result<TunnelHandle> {
        match self {
            Backend::Process(tunnel) => tunnel.open().await,
            Backend::PortForward(tunnel) => tunnel.open(&spec.local).await,
            #[cfg(test)]
            Backend::Fake(tunnel) => tunnel.open(&spec.local).await,
        }
    }
}

pub(crate) enum HandleInner {
    Process(ssh::ProcessHandle),
    PortForward(portforward::ForwardHandle),
    #[cfg(test)]
    Fake(fake::FakeHandle),
}

/// A live tunnel. Must be closed exactly once; it is never reopened.
pub struct TunnelHandle {
    kind: BackendKind,
    inner: HandleInner,
    status: watch::Receiver<BackendStatus>,
    closed: bool,
}

impl TunnelHandle {
    pub(crate) fn new(
        kind: BackendKind,
        inner: HandleInner,
        status: watch::Receiver<BackendStatus>,
    ) -> Self {
        Self {
            kind,
            inner,
            status,
            closed: false,
        }
    }

    /// Status channel fed by the backend's pump task.
    pub fn status(&self) -> watch::Receiver<BackendStatus> {
        self.status.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Tear the tunnel down. Calling this again is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            debug!(backend = %self.kind, "Tunnel already closed");
            return Ok(());
        }
        self.closed = true;

        match &mut self.inner {
            HandleInner::Process(handle) => handle.close().await,
            HandleInner::PortForward(handle) => handle.close().await,
            #[cfg(test)]
            HandleInner::Fake(handle) => handle.close().await,
        }
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        warn!(backend = %self.kind, "Tunnel handle dropped while still open, stopping it");
        match &mut self.inner {
            HandleInner::Process(handle) => handle.terminate_now(),
            HandleInner::PortForward(handle) => handle.stop_now(),
            #[cfg(test)]
            HandleInner::Fake(handle) => handle.stop_now(),
        }
    }
}

pub type BackendFactory = Box<dyn Fn(&TunnelSpec) -> Result<Backend> + Send + Sync>;

/// Maps each [`BackendKind`] to the constructor for its backend.
pub struct BackendRegistry {
    factories: HashMap<BackendKind, BackendFactory>,
}

impl BackendRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(mut self, kind: BackendKind, factory: F) -> Self
    where
        F: Fn(&TunnelSpec) -> Result<Backend> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Box::new(factory));
        self
    }

    pub fn create(&self, kind: BackendKind, spec: &TunnelSpec) -> Result<Backend> {
        let factory = self.factories.get(&kind).ok_or_else(|| {
            TunnelError::backend_unavailable(format!("No backend registered for '{}'", kind))
        })?;
        factory(spec)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::empty()
            .register(BackendKind::Ssh, |spec| {
                ProcessTunnel::from_spec(spec).map(Backend::Process)
            })
            .register(BackendKind::K8s, |spec| {
                PortForwardTunnel::from_spec(spec).map(Backend::PortForward)
            })
    }
}
