//! Termination signals routed into the session as data.

use std::io;

use nix::sys::signal::Signal;
use tokio::sync::watch;
use tracing::debug;

/// Latest termination signal received, if any.
pub struct Interrupts {
    rx: watch::Receiver<Option<i32>>,
}

impl Interrupts {
    /// Listen for SIGINT, SIGTERM and SIGHUP for the rest of the process.
    ///
    /// Once registered, these signals no longer terminate the process on
    /// their own; the session decides what each one means.
    pub fn listen() -> io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;
        let (tx, rx) = watch::channel(None);

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = interrupt.recv() => Signal::SIGINT,
                    _ = terminate.recv() => Signal::SIGTERM,
                    _ = hangup.recv() => Signal::SIGHUP,
                };
                debug!(signal = %received, "Received signal");
                if tx.send(Some(received as i32)).is_err() {
                    break;
                }
            }
        });

        Ok(Self { rx })
    }

    /// Interrupts fed by hand, for driving a session without real signals.
    #[cfg(test)]
    pub fn channel() -> (watch::Sender<Option<i32>>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { rx })
    }

    /// Wait for the next termination signal.
    ///
    /// With `include_interrupt` false, SIGINT is ignored: while the client is
    /// in the foreground it owns Ctrl-C.
    pub async fn recv(&mut self, include_interrupt: bool) -> i32 {
        loop {
            let current = *self.rx.borrow_and_update();
            if let Some(signal) = current {
                if include_interrupt || signal != Signal::SIGINT as i32 {
                    return signal;
                }
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
