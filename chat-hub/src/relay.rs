//! Standalone relay that sits between a chat client and the hub.
//!
//! The relay reads the client's nickname frame, forwards it upstream with the
//! configured marker in front, and from then on copies bytes verbatim in
//! both directions through a [`ForwardingPipe`].

use std::{future::Future, net::SocketAddr};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    pipe::ForwardingPipe,
    protocol::{MAX_FRAME_LEN, ServerMessage, read_frame, write_frame},
};

pub struct Relay {
    listener: TcpListener,
    config: RelayConfig,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self { listener, config }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts clients until `shutdown` resolves, then closes every open pipe.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { listener, config } = self;
        let closing = CancellationToken::new();
        let mut pipes = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((client, peer)) => {
                        info!(%peer, "relay accepted client");
                        let config = config.clone();
                        let closing = closing.clone();
                        pipes.spawn(async move {
                            if let Err(err) = serve_client(client, &config, &closing).await {
                                warn!(%peer, error = ?err, "relay session failed");
                            }
                        });
                    }
                    Err(err) => warn!(error = ?err, "failed to accept relay client"),
                },
                Some(finished) = pipes.join_next(), if !pipes.is_empty() => {
                    if let Err(err) = finished {
                        warn!(error = ?err, "relay task failed");
                    }
                }
            }
        }

        drop(listener);
        closing.cancel();
        while pipes.join_next().await.is_some() {}
        info!("relay stopped");
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

async fn serve_client(
    client: TcpStream,
    config: &RelayConfig,
    closing: &CancellationToken,
) -> Result<()> {
    let mut upstream = TcpStream::connect(config.upstream)
        .await
        .with_context(|| format!("failed to reach hub at {}", config.upstream))?;

    // Anything the client sends after its nickname stays buffered here and is
    // forwarded by the pipe.
    let mut client = BufReader::new(client);
    let nickname = select! {
        _ = closing.cancelled() => return Ok(()),
        frame = read_frame(&mut client) => frame.context("failed to read nickname")?,
    };
    let Some(nickname) = nickname else {
        anyhow::bail!("client closed before sending a nickname");
    };

    let rewritten = format!("{}{}", config.marker, nickname.trim());
    if rewritten.len() > MAX_FRAME_LEN {
        // The hub would drop the frame without a reply; answer for it.
        let reply = ServerMessage::Error {
            reason: format!("nickname exceeds {MAX_FRAME_LEN} bytes once marked"),
        };
        write_frame(&mut client, &reply.to_string()).await?;
        if let Err(err) = client.shutdown().await {
            debug!(error = ?err, "failed to shut down rejected relay client");
        }
        return Ok(());
    }
    write_frame(&mut upstream, &rewritten)
        .await
        .context("failed to forward nickname")?;
    info!(nickname = %rewritten, "relaying session");

    let report = ForwardingPipe::with_shutdown(client, upstream, closing)
        .run()
        .await;
    debug!(
        to_hub = report.a_to_b,
        to_client = report.b_to_a,
        first_closed = ?report.first_closed,
        "relay session ended"
    );
    Ok(())
}
