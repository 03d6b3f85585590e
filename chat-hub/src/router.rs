//! Public and private message routing on top of [`HubState`].
//!
//! All sends are non-blocking `try_send`s against a registry snapshot. A
//! recipient whose mailbox refuses a message is disconnected through
//! [`HubState::disconnect`], the one place that removes a session and
//! announces its departure.
//!
//! Observer events are published before the matching client frames go out,
//! so anything a client has seen is already queued for observers.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    error::PrivateMessageError,
    observer::ObserverEvent,
    protocol::ServerMessage,
    registry::SessionId,
    state::HubState,
};

impl HubState {
    /// Announces a freshly registered session to everyone else.
    pub fn announce_join(&self, id: SessionId, nickname: &str) {
        let joined = ServerMessage::Joined {
            nickname: nickname.to_string(),
        };
        info!("{joined}");

        self.observers().publish(ObserverEvent::system(joined.to_string()));
        self.broadcast(&joined, Some(id));
        self.broadcast_user_list();
        debug!("STATUS: {}", self.stats());
    }

    pub fn route_public(&self, sender: SessionId, nickname: &str, text: &str) {
        let message = ServerMessage::Public {
            nickname: nickname.to_string(),
            text: text.to_string(),
        };
        info!("Message: {message}");

        self.observers().publish(ObserverEvent::Public {
            sender: nickname.to_string(),
            content: text.to_string(),
        });
        self.broadcast(&message, Some(sender));
    }

    /// Delivers `text` to `target` only and acknowledges to the sender only.
    ///
    /// On error nothing has been delivered to anyone; the caller replies to
    /// the sender with the error text.
    pub fn route_private(
        &self,
        sender: SessionId,
        sender_nickname: &str,
        target: &str,
        text: &str,
    ) -> Result<(), PrivateMessageError> {
        if target == sender_nickname {
            return Err(PrivateMessageError::SelfTarget);
        }

        let recipient = self
            .registry()
            .lookup_by_nickname(target)
            .ok_or_else(|| PrivateMessageError::UnknownTarget(target.to_string()))?;

        let message = ServerMessage::Private {
            sender: sender_nickname.to_string(),
            text: text.to_string(),
        };
        if let Err(err) = recipient.deliver(Arc::from(message.to_string())) {
            warn!(recipient = target, error = %err, "private message delivery failed");
            self.disconnect(recipient.id());
            return Err(PrivateMessageError::Undeliverable(target.to_string()));
        }

        info!("Private Message: {sender_nickname} -> {target}");
        self.observers().publish(ObserverEvent::Private {
            sender: sender_nickname.to_string(),
            receiver: target.to_string(),
        });
        self.send_to(
            sender,
            &ServerMessage::system(format!("Your message was sent to {target}.")),
        );
        Ok(())
    }

    /// Sends `message` to every session except `exclude`, disconnecting any
    /// recipient that cannot take it.
    pub fn broadcast(&self, message: &ServerMessage, exclude: Option<SessionId>) {
        let failed = self.fan_out(message, exclude);
        for id in failed {
            self.disconnect(id);
        }
    }

    pub fn broadcast_user_list(&self) {
        let failed = self.fan_out(&self.user_list(), None);
        for id in failed {
            self.disconnect(id);
        }
    }

    /// Sends to a single session. Returns `false` if it is gone or was
    /// disconnected because it could not take the message.
    pub fn send_to(&self, id: SessionId, message: &ServerMessage) -> bool {
        let Some(session) = self.registry().session(id) else {
            return false;
        };
        match session.deliver(Arc::from(message.to_string())) {
            Ok(()) => true,
            Err(err) => {
                debug!(session = %id, error = %err, "direct send failed");
                self.disconnect(id);
                false
            }
        }
    }

    /// Removes a session and announces its departure, exactly once.
    ///
    /// Returns `true` only for the call that actually removed `id`.
    /// Recipients that fail while the departure is announced are queued
    /// and removed by the same loop rather than by recursion.
    pub fn disconnect(&self, id: SessionId) -> bool {
        let mut pending = vec![id];
        let mut removed_requested = false;

        while let Some(next) = pending.pop() {
            let Some(nickname) = self.registry().unregister(next) else {
                continue;
            };
            removed_requested |= next == id;

            let left = ServerMessage::Left { nickname };
            info!("{left}");

            self.observers().publish(ObserverEvent::system(left.to_string()));
            pending.extend(self.fan_out(&left, None));
            pending.extend(self.fan_out(&self.user_list(), None));
            debug!("STATUS: {}", self.stats());
        }

        removed_requested
    }

    fn user_list(&self) -> ServerMessage {
        ServerMessage::UserList {
            nicknames: self.registry().nicknames(),
        }
    }

    /// Delivers to a snapshot of the registry and reports who failed.
    fn fan_out(&self, message: &ServerMessage, exclude: Option<SessionId>) -> Vec<SessionId> {
        let payload: Arc<str> = Arc::from(message.to_string());
        self.registry()
            .snapshot()
            .into_iter()
            .filter(|session| Some(session.id()) != exclude)
            .filter_map(|session| match session.deliver(Arc::clone(&payload)) {
                Ok(()) => None,
                Err(err) => {
                    warn!(recipient = session.nickname(), error = %err, "broadcast delivery failed; removing client");
                    Some(session.id())
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use tokio::sync::mpsc;

    use super::*;
    use crate::config::HubConfig;
    use crate::observer::ObserverBridge;

    struct Harness {
        state: HubState,
        events: mpsc::UnboundedReceiver<ObserverEvent>,
    }

    struct Member {
        id: SessionId,
        inbox: mpsc::Receiver<Arc<str>>,
    }

    impl Member {
        fn drain(&mut self) -> Vec<String> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.inbox.try_recv() {
                frames.push(frame.to_string());
            }
            frames
        }
    }

    fn harness() -> Harness {
        let (bridge, events) = ObserverBridge::channel();
        Harness {
            state: HubState::new(&HubConfig::default(), bridge),
            events,
        }
    }

    impl Harness {
        fn join(&self, nickname: &str) -> Member {
            let (mailbox, inbox) = self.state.mailbox();
            let id = self
                .state
                .registry()
                .register(nickname, mailbox)
                .expect("register member");
            Member { id, inbox }
        }

        fn events(&mut self) -> Vec<ObserverEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    #[test]
    fn public_message_skips_the_sender() {
        let mut hub = harness();
        let mut ann = hub.join("ann");
        let mut bob = hub.join("bob");
        let mut cid = hub.join("cid");

        hub.state.route_public(ann.id, "ann", "hi");

        assert!(ann.drain().is_empty());
        assert_eq!(bob.drain(), ["ann: hi"]);
        assert_eq!(cid.drain(), ["ann: hi"]);
        assert_eq!(
            hub.events(),
            [ObserverEvent::Public {
                sender: "ann".into(),
                content: "hi".into()
            }]
        );
    }

    #[test]
    fn private_message_reaches_only_the_target() {
        let mut hub = harness();
        let mut ann = hub.join("ann");
        let mut bob = hub.join("bob");
        let mut cid = hub.join("cid");

        hub.state
            .route_private(bob.id, "bob", "cid", "secret")
            .expect("private message routes");

        assert!(ann.drain().is_empty());
        assert_eq!(bob.drain(), ["[System] Your message was sent to cid."]);
        assert_eq!(cid.drain(), ["[Private Message] bob: secret"]);
        assert_eq!(
            hub.events(),
            [ObserverEvent::Private {
                sender: "bob".into(),
                receiver: "cid".into()
            }]
        );
    }

    #[test]
    fn private_message_errors_deliver_nothing() {
        let mut hub = harness();
        let mut ann = hub.join("ann");
        let mut bob = hub.join("bob");

        assert_eq!(
            hub.state.route_private(ann.id, "ann", "ann", "me"),
            Err(PrivateMessageError::SelfTarget)
        );
        assert_eq!(
            hub.state.route_private(ann.id, "ann", "zed", "anyone?"),
            Err(PrivateMessageError::UnknownTarget("zed".into()))
        );

        assert!(ann.drain().is_empty());
        assert!(bob.drain().is_empty());
        assert!(hub.events().is_empty());
    }

    #[test]
    fn undeliverable_private_message_disconnects_the_target() {
        let mut hub = harness();
        let mut ann = hub.join("ann");
        let bob = hub.join("bob");
        drop(bob.inbox);

        assert_eq!(
            hub.state.route_private(ann.id, "ann", "bob", "hello?"),
            Err(PrivateMessageError::Undeliverable("bob".into()))
        );
        assert_eq!(
            ann.drain(),
            ["bob has left the chat.", "USERLIST_UPDATE:ann"]
        );
        assert!(hub.state.registry().session(bob.id).is_none());
    }

    #[test]
    fn failed_broadcast_recipient_is_removed_once() {
        let mut hub = harness();
        let mut ann = hub.join("ann");
        let bob = hub.join("bob");
        let mut cid = hub.join("cid");
        drop(bob.inbox);

        hub.state.route_public(ann.id, "ann", "hi");

        assert_eq!(
            cid.drain(),
            ["ann: hi", "bob has left the chat.", "USERLIST_UPDATE:ann,cid"]
        );
        assert_eq!(ann.drain(), ["bob has left the chat.", "USERLIST_UPDATE:ann,cid"]);
        assert_eq!(hub.state.registry().nicknames(), ["ann", "cid"]);
    }

    #[test]
    fn cascading_failures_are_drained_without_recursion() {
        let mut hub = harness();
        let mut ann = hub.join("ann");
        let bob = hub.join("bob");
        let cid = hub.join("cid");
        drop(bob.inbox);
        drop(cid.inbox);

        assert!(hub.state.disconnect(bob.id));

        let frames = ann.drain();
        assert_eq!(
            frames
                .iter()
                .filter(|f| f.as_str() == "bob has left the chat.")
                .count(),
            1
        );
        assert_eq!(
            frames
                .iter()
                .filter(|f| f.as_str() == "cid has left the chat.")
                .count(),
            1
        );
        assert_eq!(frames.last().map(String::as_str), Some("USERLIST_UPDATE:ann"));
        assert_eq!(hub.state.registry().len(), 1);
    }

    #[test]
    fn concurrent_double_disconnect_announces_once() {
        for _ in 0..50 {
            let mut hub = harness();
            let mut ann = hub.join("ann");
            let bob = hub.join("bob");
            let _bob_inbox = bob.inbox;

            let removals: Vec<bool> = thread::scope(|scope| {
                let state = &hub.state;
                let first = scope.spawn(move || state.disconnect(bob.id));
                let second = scope.spawn(move || state.disconnect(bob.id));
                vec![
                    first.join().expect("first disconnect"),
                    second.join().expect("second disconnect"),
                ]
            });

            assert_eq!(removals.iter().filter(|removed| **removed).count(), 1);
            assert_eq!(ann.drain(), ["bob has left the chat.", "USERLIST_UPDATE:ann"]);
            assert_eq!(
                hub.events(),
                [ObserverEvent::system("bob has left the chat.")]
            );
        }
    }

    #[test]
    fn join_announcement_excludes_the_newcomer() {
        let mut hub = harness();
        let mut ann = hub.join("ann");
        let mut bob = hub.join("bob");

        hub.state.announce_join(bob.id, "bob");

        assert_eq!(ann.drain(), ["bob has joined the chat.", "USERLIST_UPDATE:ann,bob"]);
        assert_eq!(bob.drain(), ["USERLIST_UPDATE:ann,bob"]);
        assert_eq!(
            hub.events(),
            [ObserverEvent::system("bob has joined the chat.")]
        );
    }
}
