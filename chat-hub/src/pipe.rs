//! Bidirectional byte relay with coupled close.
//!
//! Two copy loops run concurrently, one per direction. Whichever loop stops
//! first cancels a shared token, which interrupts the other loop even if it
//! is parked in a read that would never complete. Each loop then shuts down
//! the write half it owns. Both endpoints are dropped when [`run`] returns,
//! so each is released exactly once.
//!
//! [`run`]: ForwardingPipe::run

use std::io;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const RELAY_BUFFER: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    AToB,
    BToA,
}

/// How a copy loop stopped.
#[derive(Debug)]
pub enum PumpEnd {
    /// The source reached end-of-stream.
    Eof,
    /// A read or write failed.
    Failed(io::Error),
    /// The other direction, or the caller, closed the pipe.
    Interrupted,
}

#[derive(Debug)]
pub struct PipeReport {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub a_to_b_end: PumpEnd,
    pub b_to_a_end: PumpEnd,
    /// The direction that stopped on its own and closed the pipe, if any.
    pub first_closed: Option<Direction>,
}

pub struct ForwardingPipe<A, B> {
    a: A,
    b: B,
    close: CancellationToken,
}

impl<A, B> ForwardingPipe<A, B>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    pub fn new(a: A, b: B) -> Self {
        Self::with_shutdown(a, b, &CancellationToken::new())
    }

    /// Like [`new`](Self::new), but cancelling `shutdown` also closes the pipe.
    pub fn with_shutdown(a: A, b: B, shutdown: &CancellationToken) -> Self {
        Self {
            a,
            b,
            close: shutdown.child_token(),
        }
    }

    /// Runs both directions to completion.
    pub async fn run(self) -> PipeReport {
        let ForwardingPipe { a, b, close } = self;
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let (a_to_b, b_to_a) = tokio::join!(
            pump(a_read, b_write, &close, Direction::AToB),
            pump(b_read, a_write, &close, Direction::BToA),
        );

        let first_closed = [&a_to_b, &b_to_a]
            .into_iter()
            .find(|outcome| outcome.initiated_close)
            .map(|outcome| outcome.direction);

        PipeReport {
            a_to_b: a_to_b.bytes,
            b_to_a: b_to_a.bytes,
            a_to_b_end: a_to_b.end,
            b_to_a_end: b_to_a.end,
            first_closed,
        }
    }
}

struct PumpOutcome {
    direction: Direction,
    bytes: u64,
    end: PumpEnd,
    initiated_close: bool,
}

async fn pump<R, W>(
    mut src: R,
    mut dst: W,
    close: &CancellationToken,
    direction: Direction,
) -> PumpOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    let mut bytes = 0u64;

    let end = loop {
        let step = async {
            let read = src.read(&mut buf).await?;
            if read > 0 {
                dst.write_all(&buf[..read]).await?;
            }
            Ok::<_, io::Error>(read)
        };

        let result = select! {
            _ = close.cancelled() => break PumpEnd::Interrupted,
            result = step => result,
        };

        match result {
            Ok(0) => break PumpEnd::Eof,
            Ok(read) => bytes += read as u64,
            Err(err) => break PumpEnd::Failed(err),
        }
    };

    // Both loops share one task, so exactly one of them sees the token unset.
    let initiated_close = !close.is_cancelled();
    close.cancel();

    // The peer may already be gone; a failed shutdown changes nothing.
    if let Err(err) = dst.shutdown().await {
        debug!(?direction, error = ?err, "destination already closed");
    }

    debug!(?direction, bytes, end = ?end, "forwarding stopped");
    PumpOutcome {
        direction,
        bytes,
        end,
        initiated_close,
    }
}
