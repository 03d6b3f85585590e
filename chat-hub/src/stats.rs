use std::{fmt, sync::Arc, time::Duration};

use tokio::{select, task::JoinHandle, time::MissedTickBehavior};
use tracing::info;

use crate::state::HubState;

/// Read-only counters for the console status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub connected_sessions: usize,
    pub messages_processed: u64,
}

impl fmt::Display for HubStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Connected TCP Clients: {}] - [Total Messages Processed: {}]",
            self.connected_sessions, self.messages_processed
        )
    }
}

/// Logs [`HubStats`] every `period` until the hub shuts down.
pub(crate) fn spawn_reporter(state: Arc<HubState>, period: Duration) -> JoinHandle<()> {
    let shutdown = state.shutdown_signal();
    tokio::spawn(async move {
        if period.is_zero() {
            shutdown.cancelled().await;
            return;
        }

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;

        loop {
            select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => info!("STATUS: {}", state.stats()),
            }
        }
    })
}
