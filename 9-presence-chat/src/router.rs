//! Classification of inbound transport messages.

use tracing::trace;

use crate::{
    error::MalformedMessage,
    event::{ChatEvent, PresenceEvent, PresenceKind, Scope, Username},
    message::{Envelope, PRESENCE_TYPE, SENDER_KEY, TYPE_KEY},
    presence::{PresenceProtocol, Reaction},
    transport::Delivery,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Presence control traffic, already applied to the registry.
    Presence(Reaction),
    Chat(ChatEvent),
    /// Our own public message echoed back by the broadcast destination.
    Suppressed,
}

#[derive(Debug, Clone)]
pub struct MessageRouter {
    protocol: PresenceProtocol,
}

impl MessageRouter {
    pub fn new(protocol: PresenceProtocol) -> Self {
        Self { protocol }
    }

    pub fn protocol(&self) -> &PresenceProtocol {
        &self.protocol
    }

    /// Classifies one inbound message.
    ///
    /// Nothing is mutated when an error is returned.
    pub fn route(&self, delivery: Delivery, envelope: Envelope) -> Result<Routed, MalformedMessage> {
        let sender = sender_of(&envelope)?;

        if envelope.meta(TYPE_KEY) == Some(PRESENCE_TYPE) {
            let kind: PresenceKind = envelope.payload.parse()?;
            let reaction = self.protocol.handle(PresenceEvent::new(kind, sender));
            return Ok(Routed::Presence(reaction));
        }

        let scope = match delivery {
            Delivery::Broadcast if &sender == self.protocol.local() => {
                trace!(%sender, "suppressing own broadcast");
                return Ok(Routed::Suppressed);
            }
            Delivery::Broadcast => Scope::Public,
            Delivery::Private => Scope::Private,
        };

        Ok(Routed::Chat(ChatEvent {
            sender,
            text: envelope.payload,
            scope,
        }))
    }
}

fn sender_of(envelope: &Envelope) -> Result<Username, MalformedMessage> {
    let raw = envelope
        .meta(SENDER_KEY)
        .ok_or(MalformedMessage::MissingSender)?;
    Username::verbatim(raw).map_err(|_| MalformedMessage::BlankSender)
}
