//! Election timer for Raft.
//!
//! Fires after a randomized timeout in `[election_timeout_min,
//! election_timeout_max]` unless reset first. Followers reset it on every
//! valid message from the current leader and when they grant a vote.

use crate::config::RaftConfig;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::sleep;

/// Election timer.
///
/// ```ignore
/// let timer = Arc::new(ElectionTimer::new(config.clone()));
/// let (timeout_tx, mut timeout_rx) = tokio::sync::mpsc::channel(1);
/// tokio::spawn(timer.clone().run(timeout_tx, shutdown_tx.subscribe()));
///
/// timeout_rx.recv().await; // election timeout fired
/// timer.reset();           // heartbeat received
/// ```
pub struct ElectionTimer {
    config: RaftConfig,
    reset_notify: Notify,
}

impl ElectionTimer {
    pub fn new(config: RaftConfig) -> Self {
        Self {
            config,
            reset_notify: Notify::new(),
        }
    }

    /// Restart the countdown with a fresh random timeout.
    pub fn reset(&self) {
        self.reset_notify.notify_one();
    }

    /// Timer loop. Sends on `timeout_tx` each time the timeout elapses.
    ///
    /// A timeout that fires while the previous one is still unread is
    /// dropped; the election loop only needs to know that one happened.
    pub async fn run(
        self: Arc<Self>,
        timeout_tx: mpsc::Sender<()>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            let timeout = self.config.random_election_timeout();
            tokio::select! {
                _ = sleep(timeout) => {
                    match timeout_tx.try_send(()) {
                        Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                _ = self.reset_notify.notified() => continue,
                _ = shutdown_rx.recv() => break,
            }
        }
        tracing::debug!("Election timer stopped");
    }
}
