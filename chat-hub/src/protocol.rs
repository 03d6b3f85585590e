use std::{fmt, io};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single inbound frame, newline excluded.
pub const MAX_FRAME_LEN: usize = 1024;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

pub const CONNECTED: &str = "You are connected to the server!";
pub const SHUTTING_DOWN: &str = "Server is shutting down. Disconnecting.";
pub const RATE_LIMITED: &str = "You have exceeded the rate limit. Disconnecting.";

/// A frame sent by a client once its session is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Exit,
    Private { target: &'a str, text: &'a str },
    MalformedPrivate,
    Public(&'a str),
}

impl<'a> Command<'a> {
    /// Classifies an already-trimmed frame.
    pub fn parse(line: &'a str) -> Self {
        if line.eq_ignore_ascii_case("EXIT") {
            return Command::Exit;
        }

        let is_private = line
            .get(..3)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("PM "));
        if !is_private {
            return Command::Public(line);
        }

        let mut parts = line.splitn(3, ' ').skip(1);
        match (parts.next(), parts.next()) {
            (Some(target), Some(text)) if !target.is_empty() && !text.is_empty() => {
                Command::Private { target, text }
            }
            _ => Command::MalformedPrivate,
        }
    }
}

/// Everything the hub writes to a session, rendered through `Display`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Connected,
    Joined { nickname: String },
    Left { nickname: String },
    UserList { nicknames: Vec<String> },
    Public { nickname: String, text: String },
    Private { sender: String, text: String },
    System { text: String },
    Error { reason: String },
    ShuttingDown,
}

impl ServerMessage {
    pub fn system(text: impl Into<String>) -> Self {
        ServerMessage::System { text: text.into() }
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessage::Connected => f.write_str(CONNECTED),
            ServerMessage::Joined { nickname } => write!(f, "{nickname} has joined the chat."),
            ServerMessage::Left { nickname } => write!(f, "{nickname} has left the chat."),
            ServerMessage::UserList { nicknames } => {
                write!(f, "USERLIST_UPDATE:{}", nicknames.join(","))
            }
            ServerMessage::Public { nickname, text } => write!(f, "{nickname}: {text}"),
            ServerMessage::Private { sender, text } => {
                write!(f, "[Private Message] {sender}: {text}")
            }
            ServerMessage::System { text } => write!(f, "[System] {text}"),
            ServerMessage::Error { reason } => write!(f, "ERROR: {reason}"),
            ServerMessage::ShuttingDown => f.write_str(SHUTTING_DOWN),
        }
    }
}

/// Reads the next non-blank frame, or `None` once the peer has closed.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    // One extra byte lets an exactly-full frame still carry its newline.
    let limit = (MAX_FRAME_LEN + 1) as u64;
    let mut buf = Vec::with_capacity(128);
    loop {
        buf.clear();
        let bytes = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
        if bytes == 0 {
            return Ok(None);
        }

        if buf.last() != Some(&b'\n') && buf.len() > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {MAX_FRAME_LEN} bytes"),
            ));
        }

        let line = std::str::from_utf8(&buf)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        return Ok(Some(trimmed.to_string()));
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(frame.len() + 1);
    encoded.extend_from_slice(frame.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}
