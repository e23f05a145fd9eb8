//! Process lifecycle.
//!
//! # Data Flow
//! ```text
//! main.rs / Proxy::with_params create a Shutdown
//!     → background tasks subscribe (idle connection eviction)
//!     → SIGINT or Proxy::close fires the broadcast once
//!     → tasks observe the signal and exit
//! ```
//!
//! # Design Decisions
//! - Single broadcast channel; tasks subscribe, never poll
//! - Firing is idempotent and never blocks

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

/// Coordinator for stopping background work.
///
/// Holds a broadcast channel that long-running tasks subscribe to. Firing
/// more than once is a no-op.
#[derive(Debug)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    fired: AtomicBool,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            fired: AtomicBool::new(false),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Fire the shutdown signal. Only the first call has an effect.
    pub fn trigger(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(());
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for SIGINT (Ctrl+C).
pub async fn signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_reaches_subscribers_once() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();

        shutdown.trigger();
        shutdown.trigger();

        rx.recv().await.expect("signal delivered");
        assert!(rx.try_recv().is_err(), "second trigger is a no-op");
    }
}
