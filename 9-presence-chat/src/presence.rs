//! Join/sync presence protocol.
//!
//! A joining peer announces itself once and then asks the room for its roster
//! with a single `SyncRequest`. Every peer answers that request exactly once
//! with a `SyncResponse`, so a join costs O(n) messages. A `Join` is never
//! answered.

use std::sync::Arc;

use tracing::debug;

use crate::{
    event::{PresenceEvent, PresenceKind, Username},
    registry::PresenceRegistry,
};

/// What the session must do after an inbound presence event was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    /// Announcement to publish on the broadcast destination, if any.
    pub reply: Option<PresenceEvent>,
}

/// Presence state machine for one local user.
///
/// Holds no state besides the registry it mutates, so `handle` can be called
/// from several delivery tasks at once.
#[derive(Debug, Clone)]
pub struct PresenceProtocol {
    local: Username,
    registry: Arc<PresenceRegistry>,
}

impl PresenceProtocol {
    pub fn new(local: Username, registry: Arc<PresenceRegistry>) -> Self {
        Self { local, registry }
    }

    pub fn local(&self) -> &Username {
        &self.local
    }

    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    /// Announcements to publish, in order, once the session is connected.
    pub fn start(&self) -> [PresenceEvent; 2] {
        [
            self.announce(PresenceKind::Join),
            self.announce(PresenceKind::SyncRequest),
        ]
    }

    /// Announcement to publish when the session closes.
    pub fn shutdown(&self) -> PresenceEvent {
        self.announce(PresenceKind::Leave)
    }

    pub fn handle(&self, event: PresenceEvent) -> Reaction {
        let PresenceEvent { kind, sender } = event;
        debug!(local = %self.local, %sender, %kind, "presence event");

        let reply = match kind {
            PresenceKind::Join | PresenceKind::SyncResponse => {
                self.registry.add(sender);
                None
            }
            PresenceKind::Leave => {
                self.registry.remove(sender.as_str());
                None
            }
            PresenceKind::SyncRequest if sender == self.local => None,
            PresenceKind::SyncRequest => Some(self.announce(PresenceKind::SyncResponse)),
        };

        Reaction { reply }
    }

    fn announce(&self, kind: PresenceKind) -> PresenceEvent {
        PresenceEvent::new(kind, self.local.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn name(raw: &str) -> Username {
        Username::new(raw).expect("valid name")
    }

    fn event(kind: PresenceKind, sender: &str) -> PresenceEvent {
        PresenceEvent::new(kind, name(sender))
    }

    fn protocol(local: &str) -> PresenceProtocol {
        PresenceProtocol::new(name(local), Arc::new(PresenceRegistry::new()))
    }

    fn names(raw: &[&str]) -> BTreeSet<Username> {
        raw.iter().map(|n| name(n)).collect()
    }

    #[test]
    fn start_announces_join_then_sync_request() {
        let alice = protocol("alice");
        assert_eq!(
            alice.start(),
            [
                event(PresenceKind::Join, "alice"),
                event(PresenceKind::SyncRequest, "alice"),
            ]
        );
        assert_eq!(alice.shutdown(), event(PresenceKind::Leave, "alice"));
    }

    #[test]
    fn join_is_recorded_without_reply() {
        let bob = protocol("bob");
        bob.registry().add(name("bob"));

        let reaction = bob.handle(event(PresenceKind::Join, "alice"));

        assert_eq!(reaction.reply, None);
        assert_eq!(bob.registry().snapshot(), names(&["alice", "bob"]));
    }

    #[test]
    fn sync_request_from_peer_gets_one_response() {
        let bob = protocol("bob");

        let reaction = bob.handle(event(PresenceKind::SyncRequest, "alice"));

        assert_eq!(reaction.reply, Some(event(PresenceKind::SyncResponse, "bob")));
        assert!(bob.registry().is_empty());
    }

    #[test]
    fn own_sync_request_is_ignored() {
        let alice = protocol("alice");
        let reaction = alice.handle(event(PresenceKind::SyncRequest, "alice"));
        assert_eq!(reaction.reply, None);
    }

    #[test]
    fn own_join_echo_lists_self() {
        let alice = protocol("alice");
        alice.handle(event(PresenceKind::Join, "alice"));
        assert_eq!(alice.registry().snapshot(), names(&["alice"]));
    }

    #[test]
    fn event_sequence_produces_expected_roster() {
        let carol = protocol("carol");
        let sequence = [
            event(PresenceKind::Join, "alice"),
            event(PresenceKind::SyncResponse, "bob"),
            event(PresenceKind::SyncRequest, "dave"),
            event(PresenceKind::Join, "dave"),
            event(PresenceKind::Leave, "alice"),
            event(PresenceKind::Leave, "erin"),
            event(PresenceKind::Join, "bob"),
        ];

        for presence in sequence {
            carol.handle(presence);
        }

        assert_eq!(carol.registry().snapshot(), names(&["bob", "dave"]));
    }
}
