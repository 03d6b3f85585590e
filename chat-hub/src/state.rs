use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    config::HubConfig,
    observer::ObserverBridge,
    protocol::ServerMessage,
    registry::{Mailbox, SessionRegistry},
    stats::HubStats,
};

/// Everything the hub shares between its acceptor, session workers, and
/// background tasks.
pub struct HubState {
    registry: SessionRegistry,
    observers: ObserverBridge,
    // Kept off the registry lock so counting never contends with routing.
    messages_processed: AtomicU64,
    outbound_buffer: usize,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
}

impl HubState {
    pub fn new(config: &HubConfig, observers: ObserverBridge) -> Self {
        Self {
            registry: SessionRegistry::new(config.rate_limit),
            observers,
            messages_processed: AtomicU64::new(0),
            outbound_buffer: config.outbound_buffer.max(1),
            handshake_timeout: config.handshake_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn observers(&self) -> &ObserverBridge {
        &self.observers
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connected_sessions: self.registry.len(),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_message(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// A fresh outbound queue for a connecting session.
    pub(crate) fn mailbox(&self) -> (Mailbox, mpsc::Receiver<Arc<str>>) {
        mpsc::channel(self.outbound_buffer)
    }

    pub(crate) fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn shutdown_signal(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Tells every session the hub is going away and removes them all.
    ///
    /// Removing a session closes its mailbox, so each writer flushes the
    /// notice and then shuts its socket. No departure broadcasts are sent.
    /// Returns how many sessions were notified.
    pub fn shutdown(&self) -> usize {
        self.shutdown.cancel();

        let notice: Arc<str> = Arc::from(ServerMessage::ShuttingDown.to_string());
        let sessions = self.registry.drain();
        for session in &sessions {
            // Best effort: a full or closed mailbox just misses the notice.
            let _ = session.deliver(Arc::clone(&notice));
        }

        info!(sessions = sessions.len(), "hub shutting down");
        sessions.len()
    }
}
