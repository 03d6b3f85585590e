//! Session registry: the single source of truth for who is connected.
//!
//! Membership changes happen under one `parking_lot` mutex and nothing
//! awaits while holding it. Callers that need to send work from a
//! [`snapshot`], which is a copy, so slow recipients never block
//! registration or removal. Rate windows carry their own lock so admission
//! checks do not serialize on the membership lock.
//!
//! Each entry owns a removal token that fires when the entry leaves the
//! registry, so the session's worker learns about it without reading.
//!
//! [`snapshot`]: SessionRegistry::snapshot

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
    time::Instant,
};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{DeliveryError, RegisterError},
    rate_limit::{RateLimiter, RateWindow},
};

/// Outbound queue of a session; drained by the session's writer task.
pub type Mailbox = mpsc::Sender<Arc<str>>;

/// Registry-assigned session identifier, increasing in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A copy of one registry entry that can be used after the lock is released.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    nickname: String,
    mailbox: Mailbox,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Queues `payload` without waiting.
    pub fn deliver(&self, payload: Arc<str>) -> Result<(), DeliveryError> {
        self.mailbox.try_send(payload).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Backlogged,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

struct SessionEntry {
    nickname: String,
    mailbox: Mailbox,
    window: Arc<Mutex<RateWindow>>,
    removed: CancellationToken,
}

impl SessionEntry {
    fn handle(&self, id: SessionId) -> SessionHandle {
        SessionHandle {
            id,
            nickname: self.nickname.clone(),
            mailbox: self.mailbox.clone(),
        }
    }
}

#[derive(Default)]
struct Sessions {
    by_id: BTreeMap<SessionId, SessionEntry>,
    by_nickname: HashMap<String, SessionId>,
    next_id: u64,
}

pub struct SessionRegistry {
    sessions: Mutex<Sessions>,
    limiter: RateLimiter,
}

impl SessionRegistry {
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            sessions: Mutex::new(Sessions::default()),
            limiter,
        }
    }

    /// Claims `nickname` for a new session. The uniqueness check and the
    /// insert happen under the same lock acquisition.
    pub fn register(&self, nickname: &str, mailbox: Mailbox) -> Result<SessionId, RegisterError> {
        validate_nickname(nickname)?;

        let mut sessions = self.sessions.lock();
        if sessions.by_nickname.contains_key(nickname) {
            return Err(RegisterError::NicknameTaken(nickname.to_string()));
        }

        sessions.next_id += 1;
        let id = SessionId(sessions.next_id);
        sessions.by_nickname.insert(nickname.to_string(), id);
        sessions.by_id.insert(
            id,
            SessionEntry {
                nickname: nickname.to_string(),
                mailbox,
                window: Arc::default(),
                removed: CancellationToken::new(),
            },
        );
        Ok(id)
    }

    /// Removes a session, returning its nickname. Only the first call for a
    /// given id gets `Some`; later calls are no-ops.
    pub fn unregister(&self, id: SessionId) -> Option<String> {
        let mut sessions = self.sessions.lock();
        let entry = sessions.by_id.remove(&id)?;
        sessions.by_nickname.remove(&entry.nickname);
        entry.removed.cancel();
        Some(entry.nickname)
    }

    /// Fires once `id` leaves the registry. Already cancelled if it is gone.
    pub fn removal_signal(&self, id: SessionId) -> CancellationToken {
        match self.sessions.lock().by_id.get(&id) {
            Some(entry) => entry.removed.clone(),
            None => {
                let gone = CancellationToken::new();
                gone.cancel();
                gone
            }
        }
    }

    pub fn lookup_by_nickname(&self, nickname: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.lock();
        let id = *sessions.by_nickname.get(nickname)?;
        sessions.by_id.get(&id).map(|entry| entry.handle(id))
    }

    pub fn session(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions.lock().by_id.get(&id).map(|entry| entry.handle(id))
    }

    /// Every active session in registration order.
    pub fn snapshot(&self) -> Vec<SessionHandle> {
        self.sessions
            .lock()
            .by_id
            .iter()
            .map(|(&id, entry)| entry.handle(id))
            .collect()
    }

    pub fn nicknames(&self) -> Vec<String> {
        self.sessions
            .lock()
            .by_id
            .values()
            .map(|entry| entry.nickname.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies the rate limit to the next message of `id`, or `None` if the
    /// session is no longer registered.
    pub fn admit(&self, id: SessionId, now: Instant) -> Option<bool> {
        let window = Arc::clone(&self.sessions.lock().by_id.get(&id)?.window);
        let admitted = self.limiter.admit(&mut window.lock(), now);
        Some(admitted)
    }

    /// Empties the registry, handing back what was in it.
    pub fn drain(&self) -> Vec<SessionHandle> {
        let mut sessions = self.sessions.lock();
        sessions.by_nickname.clear();
        std::mem::take(&mut sessions.by_id)
            .into_iter()
            .map(|(id, entry)| {
                entry.removed.cancel();
                entry.handle(id)
            })
            .collect()
    }
}

pub fn validate_nickname(nickname: &str) -> Result<(), RegisterError> {
    if nickname.is_empty() {
        return Err(RegisterError::NicknameEmpty);
    }
    if nickname
        .chars()
        .any(|c| c == ',' || c.is_whitespace() || c.is_control())
    {
        return Err(RegisterError::NicknameInvalid(nickname.to_string()));
    }
    Ok(())
}
