//! The narrow capability set a chat session needs from a pub/sub transport.
//!
//! Inbound messages are handed over through a Tokio `mpsc` channel per
//! subscription rather than through listener callbacks. The session drains
//! each subscription on its own task, so broadcast and private traffic are
//! processed concurrently and in no particular order relative to each other.

use std::future::Future;

use tokio::sync::mpsc;

use crate::{
    error::TransportError,
    message::{Destination, DestinationKind, Envelope},
};

pub mod memory;
pub mod tcp;

pub use memory::{MemoryConnection, MemoryTransport};
pub use tcp::{TcpConnection, TcpTransport};

/// How an inbound message reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Broadcast,
    Private,
}

impl From<DestinationKind> for Delivery {
    fn from(kind: DestinationKind) -> Self {
        match kind {
            DestinationKind::Topic => Delivery::Broadcast,
            DestinationKind::Queue => Delivery::Private,
        }
    }
}

/// Factory for connections to one kind of broker.
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// An open link to the broker.
///
/// Implementations must accept concurrent calls from several tasks.
pub trait Connection: Send + Sync + 'static {
    fn subscribe(
        &self,
        destination: Destination,
    ) -> impl Future<Output = Result<Subscription, TransportError>> + Send;

    fn unsubscribe(
        &self,
        destination: Destination,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn publish(
        &self,
        destination: Destination,
        message: Envelope,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Stream of messages delivered to one destination.
///
/// The stream ends when the subscription is cancelled or the connection
/// closes.
#[derive(Debug)]
pub struct Subscription {
    destination: Destination,
    messages: mpsc::UnboundedReceiver<Envelope>,
}

impl Subscription {
    pub fn new(destination: Destination, messages: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self {
            destination,
            messages,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn delivery(&self) -> Delivery {
        self.destination.kind.into()
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.messages.recv().await
    }

    /// Returns an already-delivered message without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.messages.try_recv().ok()
    }
}
