//! Read-only WebSocket mirror of hub activity.
//!
//! Observers live on their own OS thread running a current-thread Tokio
//! runtime, separate from the multi-threaded runtime that serves chat
//! sessions. Session workers talk to it only through [`ObserverBridge`],
//! whose `publish` is a non-blocking channel send.
//!
//! - The reactor loop is the only code that touches the observer set.
//!   WebSocket handshakes and close detection run as tasks on the reactor
//!   runtime and report back over a membership channel.
//! - A failed or stalled send drops that observer and the fan-out continues.
//! - Events are delivered in the order they were published.

use std::{
    collections::BTreeMap,
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use futures::{Sink, SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Serialize;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
    time::timeout,
};
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bound on a single observer send before that observer is dropped.
const OBSERVER_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// One mirrored occurrence. Private messages carry no content.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverEvent {
    System { content: String },
    Public { sender: String, content: String },
    Private { sender: String, receiver: String },
}

impl ObserverEvent {
    pub fn system(content: impl Into<String>) -> Self {
        ObserverEvent::System {
            content: content.into(),
        }
    }
}

/// Cloneable, thread-safe publishing handle into the observer reactor.
#[derive(Debug, Clone)]
pub struct ObserverBridge {
    events: mpsc::UnboundedSender<ObserverEvent>,
}

impl ObserverBridge {
    /// A bridge plus the receiving end that a reactor (or a test) drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ObserverEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }

    /// Hands `event` to the reactor without waiting for delivery.
    pub fn publish(&self, event: ObserverEvent) {
        if let Err(err) = self.events.send(event) {
            debug!(event = ?err.0, "observer reactor stopped; dropping event");
        }
    }
}

/// Owner of the reactor thread.
pub struct ObserverReactor {
    bridge: ObserverBridge,
    local_addr: SocketAddr,
    observers: Arc<AtomicUsize>,
    stop: CancellationToken,
    thread: thread::JoinHandle<()>,
}

impl ObserverReactor {
    /// Binds the observer listener and starts the reactor thread. A bind
    /// failure is returned to the caller.
    pub fn start(addr: SocketAddr) -> Result<Self> {
        let listener = std::net::TcpListener::bind(addr)
            .with_context(|| format!("failed to bind observer feed on {addr}"))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let (bridge, events) = ObserverBridge::channel();
        let stop = CancellationToken::new();
        let observers = Arc::new(AtomicUsize::new(0));

        let thread = {
            let stop = stop.clone();
            let observers = Arc::clone(&observers);
            thread::Builder::new()
                .name("observer-reactor".to_string())
                .spawn(move || {
                    if let Err(err) = run_reactor(listener, events, stop, observers) {
                        error!(error = ?err, "observer reactor exited with error");
                    }
                })
                .context("failed to spawn observer reactor thread")?
        };

        Ok(Self {
            bridge,
            local_addr,
            observers,
            stop,
            thread,
        })
    }

    pub fn bridge(&self) -> ObserverBridge {
        self.bridge.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of observers currently attached.
    pub fn observer_count(&self) -> usize {
        self.observers.load(Ordering::Relaxed)
    }

    /// Stops the reactor after it flushes queued events, then joins its thread.
    pub async fn shutdown(self) -> Result<()> {
        self.stop.cancel();
        let thread = self.thread;
        tokio::task::spawn_blocking(move || thread.join())
            .await
            .context("observer reactor join task failed")?
            .map_err(|_| anyhow!("observer reactor thread panicked"))
    }
}

fn run_reactor(
    listener: std::net::TcpListener,
    events: mpsc::UnboundedReceiver<ObserverEvent>,
    stop: CancellationToken,
    gauge: Arc<AtomicUsize>,
) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build observer runtime")?;

    runtime.block_on(async move {
        let listener = TcpListener::from_std(listener)?;
        Reactor::new(listener, events, stop, gauge).run().await;
        Ok::<_, anyhow::Error>(())
    })
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

enum Membership {
    Joined {
        sink: WsSink,
        stream: WsStream,
        peer: SocketAddr,
    },
    Left(ObserverId),
}

struct Reactor {
    listener: TcpListener,
    events: mpsc::UnboundedReceiver<ObserverEvent>,
    stop: CancellationToken,
    observers: ObserverSet<WsSink>,
    membership_tx: mpsc::UnboundedSender<Membership>,
    membership_rx: mpsc::UnboundedReceiver<Membership>,
    gauge: Arc<AtomicUsize>,
}

impl Reactor {
    fn new(
        listener: TcpListener,
        events: mpsc::UnboundedReceiver<ObserverEvent>,
        stop: CancellationToken,
        gauge: Arc<AtomicUsize>,
    ) -> Self {
        let (membership_tx, membership_rx) = mpsc::unbounded_channel();
        Self {
            listener,
            events,
            stop,
            observers: ObserverSet::new(),
            membership_tx,
            membership_rx,
            gauge,
        }
    }

    async fn run(mut self) {
        loop {
            select! {
                biased;
                _ = self.stop.cancelled() => break,
                Some(event) = self.events.recv() => self.deliver(&event).await,
                Some(change) = self.membership_rx.recv() => self.apply(change),
                accepted = self.listener.accept() => self.handshake(accepted),
            }
        }

        self.drain().await;
    }

    async fn deliver(&mut self, event: &ObserverEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = ?err, "failed to encode observer event");
                return;
            }
        };

        let dropped = self.observers.fan_out(&payload).await;
        if !dropped.is_empty() {
            self.update_gauge();
        }
    }

    fn apply(&mut self, change: Membership) {
        match change {
            Membership::Joined { sink, stream, peer } => {
                let id = self.observers.insert(sink);
                info!(%peer, observer = %id, total = self.observers.len(), "observer connected");
                spawn_close_watch(id, stream, self.membership_tx.clone());
            }
            Membership::Left(id) => {
                if self.observers.remove(id) {
                    info!(observer = %id, remaining = self.observers.len(), "observer disconnected");
                }
            }
        }
        self.update_gauge();
    }

    fn handshake(&self, accepted: std::io::Result<(TcpStream, SocketAddr)>) {
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = ?err, "failed to accept observer connection");
                return;
            }
        };

        let membership = self.membership_tx.clone();
        tokio::spawn(async move {
            match accept_async(stream).await {
                Ok(ws) => {
                    let (sink, stream) = ws.split();
                    let _ = membership.send(Membership::Joined { sink, stream, peer });
                }
                Err(err) => warn!(%peer, error = %err, "observer handshake failed"),
            }
        });
    }

    /// Flushes events that were published before the stop signal, then
    /// closes every observer.
    async fn drain(mut self) {
        self.events.close();
        let mut flushed = 0usize;
        while let Ok(event) = self.events.try_recv() {
            self.deliver(&event).await;
            flushed += 1;
        }

        self.observers.close_all().await;
        self.update_gauge();
        info!(flushed, "observer reactor stopped");
    }

    fn update_gauge(&self) {
        self.gauge.store(self.observers.len(), Ordering::Relaxed);
    }
}

/// Waits for the observer to go away and reports it to the reactor loop.
fn spawn_close_watch(
    id: ObserverId,
    mut stream: WsStream,
    membership: mpsc::UnboundedSender<Membership>,
) {
    tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!(observer = %id, error = %err, "observer read failed");
                    break;
                }
            }
        }
        let _ = membership.send(Membership::Left(id));
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obs-{}", self.0)
    }
}

/// Observer sinks keyed by id. Not shared: owned by whoever drives the loop.
pub(crate) struct ObserverSet<S> {
    members: BTreeMap<ObserverId, S>,
    next_id: u64,
}

impl<S> ObserverSet<S>
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    pub(crate) fn new() -> Self {
        Self {
            members: BTreeMap::new(),
            next_id: 0,
        }
    }

    pub(crate) fn insert(&mut self, sink: S) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.members.insert(id, sink);
        id
    }

    pub(crate) fn remove(&mut self, id: ObserverId) -> bool {
        self.members.remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    /// Sends `payload` to every member; members whose send fails or stalls
    /// are removed and returned.
    pub(crate) async fn fan_out(&mut self, payload: &str) -> Vec<ObserverId> {
        let mut failed = Vec::new();
        for (&id, sink) in self.members.iter_mut() {
            match timeout(OBSERVER_SEND_TIMEOUT, sink.send(Message::text(payload))).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(observer = %id, error = %err, "observer send failed");
                    failed.push(id);
                }
                Err(_) => {
                    warn!(observer = %id, "observer send timed out");
                    failed.push(id);
                }
            }
        }

        for id in &failed {
            self.members.remove(id);
        }
        failed
    }

    pub(crate) async fn close_all(&mut self) {
        for (id, mut sink) in std::mem::take(&mut self.members) {
            match timeout(OBSERVER_SEND_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(observer = %id, error = %err, "observer close failed"),
                Err(_) => debug!(observer = %id, "observer close timed out"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc as fmpsc;
    use serde_json::json;

    use super::*;

    #[test]
    fn events_serialize_with_a_type_tag() {
        let system = serde_json::to_value(ObserverEvent::system("ann has joined the chat."))
            .expect("encode system");
        assert_eq!(
            system,
            json!({"type": "system", "content": "ann has joined the chat."})
        );

        let public = serde_json::to_value(ObserverEvent::Public {
            sender: "ann".into(),
            content: "hi".into(),
        })
        .expect("encode public");
        assert_eq!(
            public,
            json!({"type": "public", "sender": "ann", "content": "hi"})
        );

        let private = serde_json::to_value(ObserverEvent::Private {
            sender: "bob".into(),
            receiver: "cid".into(),
        })
        .expect("encode private");
        assert_eq!(
            private,
            json!({"type": "private", "sender": "bob", "receiver": "cid"})
        );
    }

    #[tokio::test]
    async fn publish_after_reactor_is_gone_is_silent() {
        let (bridge, rx) = ObserverBridge::channel();
        drop(rx);
        bridge.publish(ObserverEvent::system("nobody is listening"));
    }

    #[tokio::test]
    async fn failing_observer_is_dropped_and_others_still_receive() {
        let mut set = ObserverSet::new();

        let (healthy_tx, mut healthy_rx) = fmpsc::unbounded::<Message>();
        let (broken_tx, broken_rx) = fmpsc::unbounded::<Message>();
        let (late_tx, mut late_rx) = fmpsc::unbounded::<Message>();
        drop(broken_rx);

        let healthy = set.insert(healthy_tx);
        let broken = set.insert(broken_tx);
        let late = set.insert(late_tx);

        let dropped = set.fan_out("{\"type\":\"system\",\"content\":\"x\"}").await;
        assert_eq!(dropped, vec![broken]);
        assert_eq!(set.len(), 2);

        let first = healthy_rx.next().await.expect("healthy observer receives");
        assert_eq!(first, Message::text("{\"type\":\"system\",\"content\":\"x\"}"));
        let third = late_rx.next().await.expect("observer after the failure receives");
        assert_eq!(third, first);

        assert!(set.remove(healthy));
        assert!(!set.remove(broken));
        assert!(set.remove(late));
    }

    #[tokio::test]
    async fn fan_out_preserves_publication_order() {
        let mut set = ObserverSet::new();
        let (tx, mut rx) = fmpsc::unbounded::<Message>();
        set.insert(tx);

        for i in 0..5 {
            set.fan_out(&format!("event-{i}")).await;
        }
        set.close_all().await;

        let received: Vec<_> = rx.collect().await;
        let expected: Vec<_> = (0..5).map(|i| Message::text(format!("event-{i}"))).collect();
        assert_eq!(received, expected);
    }
}
