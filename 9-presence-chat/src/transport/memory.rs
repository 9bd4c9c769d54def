//! In-process transport with topic fan-out and single-consumer queues.

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{sync::mpsc, time::sleep};
use tracing::debug;

use super::{Connection, Subscription, Transport};
use crate::{
    error::TransportError,
    message::{Destination, DestinationKind, Envelope},
};

type ConnectionId = u64;
type Route = (ConnectionId, mpsc::UnboundedSender<Envelope>);

/// Shared hub. Clones talk to the same set of destinations.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
}

#[derive(Debug, Default)]
struct Hub {
    routes: Mutex<HashMap<Destination, Vec<Route>>>,
    next_id: AtomicU64,
    refuse_connections: AtomicBool,
    fail_publishes: AtomicBool,
    connect_delay_ms: AtomicU64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent `connect` calls fail as if the broker were down.
    pub fn refuse_connections(&self, refuse: bool) {
        self.hub.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Makes every `publish` fail until switched back.
    pub fn fail_publishes(&self, fail: bool) {
        self.hub.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Makes `connect` take at least `delay` before it resolves.
    pub fn delay_connections(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.hub.connect_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Ends every open subscription, as a broker crash would.
    pub fn drop_subscriptions(&self) {
        self.hub.routes().clear();
    }

    pub fn subscriber_count(&self, destination: &Destination) -> usize {
        self.hub
            .routes()
            .get(destination)
            .map_or(0, |routes| routes.len())
    }
}

impl Hub {
    fn routes(&self) -> MutexGuard<'_, HashMap<Destination, Vec<Route>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, destination: &Destination, message: Envelope) {
        let mut routes = self.routes();
        let Some(subscribers) = routes.get_mut(destination) else {
            debug!(destination = %destination.name, "no subscribers, dropping message");
            return;
        };

        match destination.kind {
            DestinationKind::Topic => {
                subscribers.retain(|(_, tx)| tx.send(message.clone()).is_ok());
            }
            DestinationKind::Queue => {
                let mut pending = Some(message);
                subscribers.retain(|(_, tx)| match pending.take() {
                    Some(message) => match tx.send(message) {
                        Ok(()) => true,
                        Err(mpsc::error::SendError(message)) => {
                            pending = Some(message);
                            false
                        }
                    },
                    None => !tx.is_closed(),
                });
                if pending.is_some() {
                    debug!(destination = %destination.name, "queue has no live consumer, dropping message");
                }
            }
        }
    }

    fn detach(&self, id: ConnectionId, destination: Option<&Destination>) {
        let mut routes = self.routes();
        for (dest, subscribers) in routes.iter_mut() {
            if destination.is_none_or(|d| d == dest) {
                subscribers.retain(|(owner, _)| *owner != id);
            }
        }
        routes.retain(|_, subscribers| !subscribers.is_empty());
    }
}

impl Transport for MemoryTransport {
    type Connection = MemoryConnection;

    async fn connect(&self, address: &str) -> Result<MemoryConnection, TransportError> {
        let delay = self.hub.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            sleep(Duration::from_millis(delay)).await;
        }
        if self.hub.refuse_connections.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable {
                address: address.to_string(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "hub refused connection"),
            });
        }

        Ok(MemoryConnection {
            id: self.hub.next_id.fetch_add(1, Ordering::Relaxed),
            hub: Arc::clone(&self.hub),
            closed: AtomicBool::new(false),
        })
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    hub: Arc<Hub>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

impl Connection for MemoryConnection {
    async fn subscribe(&self, destination: Destination) -> Result<Subscription, TransportError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub
            .routes()
            .entry(destination.clone())
            .or_default()
            .push((self.id, tx));
        Ok(Subscription::new(destination, rx))
    }

    async fn unsubscribe(&self, destination: Destination) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.hub.detach(self.id, Some(&destination));
        Ok(())
    }

    async fn publish(&self, destination: Destination, message: Envelope) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.hub.fail_publishes.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("publishing disabled".to_string()));
        }
        self.hub.deliver(&destination, message);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.hub.detach(self.id, None);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.hub.detach(self.id, None);
    }
}
