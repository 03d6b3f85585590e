//! One worker per accepted chat connection.
//!
//! A session moves through `Unauthenticated` (waiting for a nickname),
//! `Active` (registered), `Closing` (a [`CloseReason`] was produced) and
//! `Removed` (the registry entry is gone). Removal goes through
//! [`HubState::disconnect`], so it happens once no matter how many paths
//! race to it.
//!
//! Outbound frames never go straight to the socket: they are queued in the
//! session's mailbox and written by a dedicated writer task. The registry
//! owns the mailbox sender, so unregistering a session is what ends its
//! writer and closes the socket. The worker also watches the entry's
//! removal signal, so a session evicted while its writer is stuck on a
//! full socket is still torn down.

use std::{
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::PrivateMessageError,
    protocol::{Command, RATE_LIMITED, ServerMessage, read_frame, write_frame},
    registry::SessionId,
    state::HubState,
};

/// How long a closing session may spend flushing its last frames.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub(crate) enum CloseReason {
    Exit,
    PeerClosed,
    Transport(io::Error),
    RateLimited,
    /// Removed by someone else: a failed delivery or a dead writer.
    Evicted,
    Shutdown,
}

pub(crate) async fn serve_connection(stream: TcpStream, state: Arc<HubState>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let Some(nickname) = perform_handshake(&state, &mut reader).await? else {
        return Ok(());
    };

    let (mailbox, inbox) = state.mailbox();
    // Queued before registration so it precedes anything broadcast to us.
    let _ = mailbox.try_send(Arc::from(ServerMessage::Connected.to_string()));

    let id = match state.registry().register(&nickname, mailbox) {
        Ok(id) => id,
        Err(err) => {
            info!(?peer, nickname, error = %err, "rejected nickname");
            let reply = ServerMessage::Error {
                reason: err.to_string(),
            };
            write_frame(&mut writer, &reply.to_string()).await?;
            if let Err(err) = writer.shutdown().await {
                debug!(?peer, error = ?err, "failed to shut down rejected connection");
            }
            return Ok(());
        }
    };

    let writer_closed = CancellationToken::new();
    let outbound = tokio::spawn(forward_outbound(inbox, writer, writer_closed.clone()));
    let removed = state.registry().removal_signal(id);

    info!(?peer, session = %id, nickname, "client joined");
    state.announce_join(id, &nickname);

    let reason = run_session(&state, id, &nickname, &mut reader, &writer_closed, &removed).await;
    log_close(id, &nickname, &reason);

    state.disconnect(id);
    finish_outbound(outbound).await;

    Ok(())
}

/// Reads the nickname frame. `None` means the hub began shutting down first.
async fn perform_handshake<R>(state: &HubState, reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let shutdown = state.shutdown_signal();
    let limit = state.handshake_timeout();
    let frame = select! {
        _ = shutdown.cancelled() => return Ok(None),
        frame = timeout(limit, read_frame(reader)) => frame
            .with_context(|| format!("no nickname within {limit:?}"))?
            .context("failed to read nickname")?,
    };

    match frame {
        Some(nickname) => Ok(Some(nickname.trim().to_string())),
        None => anyhow::bail!("connection closed before handshake"),
    }
}

async fn run_session<R>(
    state: &HubState,
    id: SessionId,
    nickname: &str,
    reader: &mut R,
    writer_closed: &CancellationToken,
    removed: &CancellationToken,
) -> CloseReason
where
    R: AsyncBufRead + Unpin,
{
    let shutdown = state.shutdown_signal();

    loop {
        let frame = select! {
            biased;
            _ = shutdown.cancelled() => return CloseReason::Shutdown,
            _ = removed.cancelled() => return CloseReason::Evicted,
            _ = writer_closed.cancelled() => return CloseReason::Evicted,
            frame = read_frame(reader) => frame,
        };

        let line = match frame {
            Ok(Some(line)) => line,
            Ok(None) => return CloseReason::PeerClosed,
            Err(err) => return CloseReason::Transport(err),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match state.registry().admit(id, Instant::now()) {
            Some(true) => {}
            Some(false) => {
                warn!(session = %id, nickname, "RATE LIMIT: disconnected for spamming");
                state.send_to(id, &ServerMessage::system(RATE_LIMITED));
                return CloseReason::RateLimited;
            }
            None => return CloseReason::Evicted,
        }
        state.record_message();

        match Command::parse(line) {
            Command::Exit => return CloseReason::Exit,
            Command::Public(text) => state.route_public(id, nickname, text),
            Command::Private { target, text } => {
                if let Err(err) = state.route_private(id, nickname, target, text) {
                    state.send_to(id, &ServerMessage::system(err.to_string()));
                }
            }
            Command::MalformedPrivate => {
                let reply = ServerMessage::system(PrivateMessageError::Malformed.to_string());
                state.send_to(id, &reply);
            }
        }
    }
}

/// Writes queued frames until the mailbox closes, then shuts the socket.
/// `closed` fires when this task ends for any reason.
async fn forward_outbound<W>(
    mut inbox: mpsc::Receiver<Arc<str>>,
    mut writer: W,
    closed: CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = async {
        while let Some(frame) = inbox.recv().await {
            write_frame(&mut writer, &frame).await?;
        }
        writer.shutdown().await
    }
    .await;

    closed.cancel();
    result
}

async fn finish_outbound(mut outbound: JoinHandle<io::Result<()>>) {
    match timeout(FLUSH_TIMEOUT, &mut outbound).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => debug!(error = ?err, "session writer stopped with error"),
        Ok(Err(err)) => warn!(error = ?err, "session writer task failed"),
        Err(_) => {
            debug!("session writer did not flush in time");
            outbound.abort();
        }
    }
}

fn log_close(id: SessionId, nickname: &str, reason: &CloseReason) {
    match reason {
        CloseReason::Exit => info!(session = %id, nickname, "sent 'Exit' command"),
        CloseReason::PeerClosed => debug!(session = %id, nickname, "client closed the connection"),
        CloseReason::Transport(err) => {
            warn!(session = %id, nickname, error = ?err, "client connection failed")
        }
        CloseReason::RateLimited => {}
        CloseReason::Evicted => debug!(session = %id, nickname, "session removed by the hub"),
        CloseReason::Shutdown => debug!(session = %id, nickname, "closing for shutdown"),
    }
}
