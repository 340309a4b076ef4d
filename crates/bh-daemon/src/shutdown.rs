use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal: cooperative shutdown coordination
// ---------------------------------------------------------------------------

/// One-shot shutdown flag shared between the signal listener and the
/// daemon's main loop.
///
/// Backed by a watch channel, so a waiter that arrives after `trigger()`
/// still sees the shutdown.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
/// let waiter = shutdown.clone();
///
/// tokio::select! {
///     _ = waiter.wait() => { /* graceful cleanup */ }
///     _ = do_work() => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Check if shutdown has been triggered (non-blocking).
    pub fn is_shutting_down(&self) -> bool {
        *self.rx.borrow()
    }

    /// Trigger shutdown for all waiters.
    pub fn trigger(&self) {
        if self.tx.send_replace(true) {
            warn!("shutdown already triggered");
        } else {
            info!("shutdown signal triggered");
        }
    }

    /// Resolve once shutdown has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of `self`, so this cannot
        // observe a closed channel while we hold one.
        let _ = rx.wait_for(|down| *down).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve on the first ctrl-c or SIGTERM.
pub async fn wait_for_os_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok("ctrl_c")
        }
        _ = terminate.recv() => Ok("sigterm"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_signal_is_not_shutting_down() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());
    }

    #[test]
    fn double_trigger_is_idempotent() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        signal.trigger(); // no panic
        assert!(signal.is_shutting_down());
    }

    #[tokio::test]
    async fn late_waiter_sees_earlier_trigger() {
        let signal = ShutdownSignal::new();
        signal.clone().trigger();
        tokio::time::timeout(std::time::Duration::from_secs(1), signal.wait())
            .await
            .expect("wait should resolve immediately");
    }

    #[tokio::test]
    async fn clones_share_the_flag() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        signal.trigger();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
