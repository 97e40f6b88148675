//! Readiness gate: wait until the tunnel's local endpoint accepts connections.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::tunnel::{BackendStatus, Endpoint};

pub const DEFAULT_ATTEMPTS: u32 = 10;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound for a single connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_ATTEMPTS,
            interval: DEFAULT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready { attempts: u32 },
    Timeout { attempts: u32 },
    BackendFailed(String),
}

#[derive(Debug, Clone, Default)]
pub struct ReadinessProbe {
    policy: ReadinessPolicy,
}

impl ReadinessProbe {
    pub fn new(policy: ReadinessPolicy) -> Self {
        Self { policy }
    }

    /// Poll `local` until it accepts a TCP connection.
    ///
    /// Each failed attempt is followed by `interval` of sleep, cut short if
    /// the backend reports a failure on `status`. Individual connect errors
    /// are never surfaced, only the final verdict.
    pub async fn wait_ready(
        &self,
        local: &Endpoint,
        mut status: watch::Receiver<BackendStatus>,
    ) -> Readiness {
        info!(address = %local, "Waiting until tunnel is open");

        for attempt in 1..=self.policy.max_attempts {
            if let BackendStatus::Failed(cause) = &*status.borrow_and_update() {
                return Readiness::BackendFailed(cause.clone());
            }

            if try_connect(local).await {
                info!(attempts = attempt, "Tunnel is opened");
                return Readiness::Ready { attempts: attempt };
            }
            debug!(attempt, "Tunnel not open yet");

            tokio::select! {
                _ = tokio::time::sleep(self.policy.interval) => {}
                changed = status.changed() => {
                    // A dropped sender just means nobody reports status; keep waiting
                    if changed.is_err() {
                        tokio::time::sleep(self.policy.interval).await;
                    }
                }
            }
        }

        if let BackendStatus::Failed(cause) = &*status.borrow() {
            return Readiness::BackendFailed(cause.clone());
        }
        Readiness::Timeout {
            attempts: self.policy.max_attempts,
        }
    }
}

async fn try_connect(local: &Endpoint) -> bool {
    let connect = TcpStream::connect((local.host.as_str(), local.port));
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, connect).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;

    fn running() -> (watch::Sender<BackendStatus>, watch::Receiver<BackendStatus>) {
        watch::channel(BackendStatus::Running)
    }

    async fn unused_endpoint() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        Endpoint::new("127.0.0.1", port)
    }

    #[test]
    fn test_default_policy() {
        let policy = ReadinessPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_ready_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (_tx, rx) = running();

        let probe = ReadinessProbe::default();
        let result = probe
            .wait_ready(&Endpoint::new("127.0.0.1", port), rx)
            .await;
        assert_eq!(result, Readiness::Ready { attempts: 1 });
    }

    #[tokio::test]
    async fn test_ready_once_listener_appears() {
        let local = unused_endpoint().await;
        let (_tx, rx) = running();

        let bind_to = local.clone();
        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            TcpListener::bind((bind_to.host.as_str(), bind_to.port))
                .await
                .unwrap()
        });

        let probe = ReadinessProbe::new(ReadinessPolicy {
            max_attempts: 20,
            interval: Duration::from_millis(100),
        });
        let result = probe.wait_ready(&local, rx).await;
        let _listener = late.await.unwrap();

        match result {
            Readiness::Ready { attempts } => {
                assert!(attempts > 1, "attempts: {}", attempts);
                assert!(attempts <= 20, "attempts: {}", attempts);
            }
            other => panic!("expected ready, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_after_exact_attempts() {
        let local = unused_endpoint().await;
        let (_tx, rx) = running();
        let policy = ReadinessPolicy {
            max_attempts: 3,
            interval: Duration::from_millis(50),
        };

        let started = Instant::now();
        let result = ReadinessProbe::new(policy).wait_ready(&local, rx).await;
        let elapsed = started.elapsed();

        assert_eq!(result, Readiness::Timeout { attempts: 3 });
        assert!(elapsed >= Duration::from_millis(150), "elapsed: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "elapsed: {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_backend_failure_short_circuits() {
        let local = unused_endpoint().await;
        let (tx, rx) = running();
        let policy = ReadinessPolicy {
            max_attempts: 100,
            interval: Duration::from_secs(5),
        };

        let failer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(BackendStatus::Failed("ssh exited with exit status: 255".into()))
                .unwrap();
            tx
        });

        let started = Instant::now();
        let result = ReadinessProbe::new(policy).wait_ready(&local, rx).await;
        let _tx = failer.await.unwrap();

        assert_eq!(
            result,
            Readiness::BackendFailed("ssh exited with exit status: 255".into())
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_zero_attempts_times_out() {
        let local = unused_endpoint().await;
        let (_tx, rx) = running();
        let policy = ReadinessPolicy {
            max_attempts: 0,
            interval: Duration::from_secs(1),
        };
        let result = ReadinessProbe::new(policy).wait_ready(&local, rx).await;
        assert_eq!(result, Readiness::Timeout { attempts: 0 });
    }
}
