//! In-process backend for session tests. Counts how often it is closed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::error::{Result, TunnelError};
use crate::tunnel::{BackendKind, BackendStatus, Endpoint, HandleInner, TunnelHandle};

#[derive(Default)]
pub(crate) struct FakeTunnel {
    pub closes: Arc<AtomicUsize>,
    /// Bind the local endpoint so the probe sees it open
    pub listen: bool,
    pub fail_open: bool,
    /// Report this failure on the status channel right after opening
    pub failure: Option<String>,
}

impl FakeTunnel {
    pub(crate) async fn open(&self, local: &Endpoint) -> Result<TunnelHandle> {
        if self.fail_open {
            return Err(TunnelError::spawn_failed("fake transport refused to start"));
        }

        let listener = if self.listen {
            Some(
                TcpListener::bind((local.host.as_str(), local.port))
                    .await
                    .map_err(|e| TunnelError::spawn_failed(e.to_string()))?,
            )
        } else {
            None
        };

        let initial = match &self.failure {
            Some(cause) => BackendStatus::Failed(cause.clone()),
            None => BackendStatus::Running,
        };
        let (status_tx, status_rx) = watch::channel(initial);

        Ok(TunnelHandle::new(
            BackendKind::Ssh,
            HandleInner::Fake(FakeHandle {
                listener,
                closes: Arc::clone(&self.closes),
                _status: status_tx,
            }),
            status_rx,
        ))
    }
}

pub(crate) struct FakeHandle {
    listener: Option<TcpListener>,
    closes: Arc<AtomicUsize>,
    _status: watch::Sender<BackendStatus>,
}

impl FakeHandle {
    pub(crate) async fn close(&mut self) -> Result<()> {
        self.listener.take();
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn stop_now(&mut self) {
        self.listener.take();
    }
}
