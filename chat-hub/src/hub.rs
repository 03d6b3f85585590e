use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::{JoinError, JoinSet},
    time::timeout,
};
use tracing::{info, warn};

use crate::{
    config::HubConfig, observer::ObserverBridge, session::serve_connection, state::HubState, stats,
};

/// Accepts chat connections and runs one session worker per connection.
pub struct Hub {
    listener: TcpListener,
    state: Arc<HubState>,
    config: HubConfig,
}

impl Hub {
    pub fn new(listener: TcpListener, observers: ObserverBridge, config: HubConfig) -> Self {
        Self {
            listener,
            state: Arc::new(HubState::new(&config, observers)),
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<HubState> {
        Arc::clone(&self.state)
    }

    /// Serves until `shutdown` resolves, then notifies and closes every
    /// session and waits for the workers to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Hub {
            listener,
            state,
            config,
        } = self;
        let reporter = stats::spawn_reporter(Arc::clone(&state), config.stats_interval);
        let mut workers = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &mut workers);
                }
                Some(finished) = workers.join_next(), if !workers.is_empty() => {
                    log_worker_exit(finished);
                }
            }
        }

        drop(listener);
        state.shutdown();
        drain_workers(&mut workers, config.shutdown_grace).await;
        if let Err(err) = reporter.await {
            warn!(error = ?err, "status reporter failed");
        }

        info!("hub stopped");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<HubState>,
    workers: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => {
            info!(%peer, "new TCP connection accepted");
            let state = Arc::clone(state);
            workers.spawn(async move {
                if let Err(err) = serve_connection(stream, state).await {
                    warn!(peer = %peer, error = ?err, "client connection closed with error");
                }
            });
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn log_worker_exit(result: Result<(), JoinError>) {
    if let Err(err) = result {
        if err.is_panic() {
            warn!(error = ?err, "session worker panicked");
        }
    }
}

async fn drain_workers(workers: &mut JoinSet<()>, grace: Duration) {
    let drained = timeout(grace, async {
        while let Some(finished) = workers.join_next().await {
            log_worker_exit(finished);
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = workers.len(),
            "aborting session workers that outlived shutdown"
        );
        workers.shutdown().await;
    }
}
