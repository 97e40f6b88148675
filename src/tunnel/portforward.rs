//! Tunnel through the Kubernetes `portforward` subresource.
//!
//! One port-forward to the target pod is set up and torn down before the
//! local listener is bound, so nothing accepts connections until the cluster
//! has agreed to forward. After that every accepted connection gets its own
//! port-forward stream. A failed connection is logged and dropped; only a
//! broken listener marks the backend as failed.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{ListParams, Portforwarder};
use kube::{Api, Client};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{Result, TunnelError};
use crate::tunnel::{
    BackendKind, BackendParams, BackendStatus, Endpoint, HandleInner, ResourceKind, TunnelHandle,
    TunnelSpec,
};

/// How long `close` waits for the accept loop to unwind.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Upper bound for setting up the first port-forward.
const FORWARD_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PortForwardTunnel {
    namespace: String,
    resource_kind: ResourceKind,
    resource_name: String,
    remote_port: u16,
}

impl PortForwardTunnel {
    pub fn from_spec(spec: &TunnelSpec) -> Result<Self> {
        let BackendParams::Kube(params) = &spec.params else {
            return Err(TunnelError::invalid_spec(
                "k8s tunnel requires namespace/resource parameters",
            ));
        };
        if params.resource_name.is_empty() {
            return Err(TunnelError::invalid_spec(
                "k8s tunnel needs a resource name to port forward",
            ));
        }

        Ok(Self {
            namespace: params.namespace.clone(),
            resource_kind: params.resource_kind,
            resource_name: params.resource_name.clone(),
            remote_port: spec.remote.port,
        })
    }

    pub async fn open(&self, local: &Endpoint) -> Result<TunnelHandle> {
        let client = Client::try_default().await.map_err(|e| {
            TunnelError::backend_unavailable(format!("kubernetes client configuration: {}", e))
        })?;
        self.open_with(client, local).await
    }

    async fn open_with(&self, client: Client, local: &Endpoint) -> Result<TunnelHandle> {
        let (pod, port) = self.resolve_target(client.clone()).await?;
        info!(
            namespace = %self.namespace,
            pod = %pod,
            port,
            "Opening PortForward"
        );

        let pods: Api<Pod> = Api::namespaced(client, &self.namespace);
        let target = Target { pods, pod, port };
        target.check().await?;

        let listener = TcpListener::bind((local.host.as_str(), local.port))
            .await
            .map_err(|e| TunnelError::spawn_failed(format!("failed to bind {}: {}", local, e)))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(BackendStatus::Running);
        let accept = tokio::spawn(accept_loop(listener, target, stop_rx, status_tx));

        Ok(TunnelHandle::new(
            BackendKind::K8s,
            HandleInner::PortForward(ForwardHandle {
                stop: stop_tx,
                accept: Some(accept),
            }),
            status_rx,
        ))
    }

    /// Resolve the configured resource to a concrete pod name and pod port.
    async fn resolve_target(&self, client: Client) -> Result<(String, u16)> {
        match self.resource_kind {
            ResourceKind::Pod => {
                let pods: Api<Pod> = Api::namespaced(client, &self.namespace);
                pods.get(&self.resource_name).await.map_err(|e| {
                    TunnelError::spawn_failed(format!(
                        "pod {}/{}: {}",
                        self.namespace, self.resource_name, e
                    ))
                })?;
                Ok((self.resource_name.clone(), self.remote_port))
            }
            ResourceKind::Service => self.resolve_service(client).await,
        }
    }

    async fn resolve_service(&self, client: Client) -> Result<(String, u16)> {
        let services: Api<Service> = Api::namespaced(client.clone(), &self.namespace);
        let service = services.get(&self.resource_name).await.map_err(|e| {
            TunnelError::spawn_failed(format!(
                "service {}/{}: {}",
                self.namespace, self.resource_name, e
            ))
        })?;
        let spec = service.spec.unwrap_or_default();

        let selector = spec.selector.unwrap_or_default();
        if selector.is_empty() {
            return Err(TunnelError::spawn_failed(format!(
                "service {} has no selector",
                self.resource_name
            )));
        }

        let pods: Api<Pod> = Api::namespaced(client, &self.namespace);
        let list = pods
            .list(&ListParams::default().labels(&label_selector(&selector)))
            .await
            .map_err(|e| TunnelError::spawn_failed(format!("listing pods: {}", e)))?;
        let pod = list
            .items
            .into_iter()
            .find(is_running)
            .ok_or_else(|| {
                TunnelError::spawn_failed(format!(
                    "no running pods for service {}",
                    self.resource_name
                ))
            })?;
        let pod_name = pod.metadata.name.clone().unwrap_or_default();

        let target_port = spec
            .ports
            .unwrap_or_default()
            .into_iter()
            .find(|p| i32::from(self.remote_port) == p.port)
            .and_then(|p| p.target_port);
        let port = match target_port {
            Some(IntOrString::Int(port)) => u16::try_from(port).ok(),
            Some(IntOrString::String(name)) => named_container_port(&pod, &name),
            None => Some(self.remote_port),
        }
        .ok_or_else(|| {
            TunnelError::spawn_failed(format!(
                "cannot map service port {} to a pod port",
                self.remote_port
            ))
        })?;

        debug!(service = %self.resource_name, pod = %pod_name, port, "Resolved service");
        Ok((pod_name, port))
    }
}

fn label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Running")
}

fn named_container_port(pod: &Pod, name: &str) -> Option<u16> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .find(|p| p.name.as_deref() == Some(name))
        .and_then(|p| u16::try_from(p.container_port).ok())
}

#[derive(Clone)]
struct Target {
    pods: Api<Pod>,
    pod: String,
    port: u16,
}

impl Target {
    async fn forward(&self) -> Result<Portforwarder> {
        self.pods
            .portforward(&self.pod, &[self.port])
            .await
            .map_err(|e| TunnelError::backend_failed(format!("portforward {}: {}", self.pod, e)))
    }

    /// Set up one port-forward stream and tear it down again.
    async fn check(&self) -> Result<()> {
        let mut forwarder = tokio::time::timeout(FORWARD_CHECK_TIMEOUT, self.forward())
            .await
            .map_err(|_| {
                TunnelError::backend_failed(format!("portforward {}: timed out", self.pod))
            })??;
        let stream = forwarder.take_stream(self.port);
        forwarder.abort();
        if stream.is_none() {
            return Err(TunnelError::backend_failed(format!(
                "no stream for port {}",
                self.port
            )));
        }
        debug!(pod = %self.pod, port = self.port, "Port forward accepted");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    target: Target,
    mut stop: watch::Receiver<bool>,
    status: watch::Sender<BackendStatus>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Accepted local connection");
                    let target = target.clone();
                    connections.spawn(async move {
                        if let Err(e) = forward_connection(stream, &target).await {
                            warn!(%peer, "Port forward connection failed: {}", e);
                        }
                    });
                }
                Err(e) => {
                    status.send_replace(BackendStatus::Failed(format!("accept failed: {}", e)));
                    break;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    debug!(active = connections.len(), "Stopping port forward connections");
    connections.shutdown().await;
}

async fn forward_connection(mut local: TcpStream, target: &Target) -> Result<()> {
    let mut forwarder = target.forward().await?;

    let mut upstream = forwarder.take_stream(target.port).ok_or_else(|| {
        TunnelError::backend_failed(format!("no stream for port {}", target.port))
    })?;

    if let Some(errors) = forwarder.take_error(target.port) {
        tokio::spawn(async move {
            if let Some(message) = errors.await {
                warn!("Port forward error: {}", message);
            }
        });
    }

    // Reset or early close by either peer is ordinary for proxied sessions
    if let Err(e) = tokio::io::copy_bidirectional(&mut local, &mut upstream).await {
        debug!("Port forward copy ended: {}", e);
    }
    drop(upstream);

    forwarder
        .join()
        .await
        .map_err(|e| TunnelError::backend_failed(format!("portforward {}: {}", target.pod, e)))
}

pub(crate) struct ForwardHandle {
    stop: watch::Sender<bool>,
    accept: Option<JoinHandle<()>>,
}

impl ForwardHandle {
    pub(crate) async fn close(&mut self) -> Result<()> {
        let Some(mut accept) = self.accept.take() else {
            return Ok(());
        };
        info!("Closing PortForward");
        let _ = self.stop.send(true);

        match tokio::time::timeout(CLOSE_GRACE, &mut accept).await {
            Ok(_) => Ok(()),
            Err(_) => {
                accept.abort();
                Err(TunnelError::close_failed(
                    "port forward did not stop in time",
                ))
            }
        }
    }

    pub(crate) fn stop_now(&mut self) {
        let _ = self.stop.send(true);
        if let Some(accept) = self.accept.take() {
            accept.abort();
        }
    }
}
