//! One user's chat lifecycle on top of a [`Transport`].
//!
//! # Concurrency
//!
//! Each subscription is drained on its own Tokio task. The chat and presence
//! callbacks may therefore run concurrently on different worker threads; a
//! caller that needs single-threaded access (a terminal or UI loop) must
//! forward the events onto its own context, for example through a channel.
//!
//! Inbound events that arrive once `close` has started are dropped, and no
//! presence reply is published after the `Leave` announcement.

use std::{
    collections::BTreeSet,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::{sync, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    config::SessionConfig,
    error::{SessionError, TransportError},
    event::{ChatEvent, PresenceEvent, Username},
    message::{Destination, Envelope},
    presence::PresenceProtocol,
    registry::PresenceRegistry,
    router::{MessageRouter, Routed},
    transport::{Connection, Subscription, Transport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

type ChatCallback = Arc<dyn Fn(ChatEvent) + Send + Sync>;
type PresenceCallback = Arc<dyn Fn() + Send + Sync>;
type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

pub struct ChatSession<T: Transport> {
    config: SessionConfig,
    transport: T,
    shared: Arc<Shared>,
    owns_registry: bool,
    /// Held by `connect` for its whole run, so `close` waits for it.
    link: sync::Mutex<Option<Link<T::Connection>>>,
}

/// State reachable from the delivery tasks.
struct Shared {
    state: Mutex<SessionState>,
    router: MessageRouter,
    broadcast: Destination,
    /// Replies publish under a read guard; teardown takes the write guard
    /// before announcing `Leave`.
    outbound: sync::RwLock<()>,
    lost: AtomicBool,
    on_chat: RwLock<Option<ChatCallback>>,
    on_presence: RwLock<Option<PresenceCallback>>,
    on_disconnect: RwLock<Option<DisconnectCallback>>,
}

/// Transport resources held while connected.
struct Link<C> {
    connection: Arc<C>,
    subscriptions: Vec<Destination>,
    deliveries: Vec<JoinHandle<()>>,
}

impl<T: Transport> ChatSession<T> {
    /// Creates a session with its own presence registry.
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self::build(transport, config, Arc::new(PresenceRegistry::new()), true)
    }

    /// Creates a session that records presence into `registry`, which may be
    /// shared with other sessions in the process. The registry is left intact
    /// when this session closes.
    pub fn with_registry(
        transport: T,
        config: SessionConfig,
        registry: Arc<PresenceRegistry>,
    ) -> Self {
        Self::build(transport, config, registry, false)
    }

    fn build(
        transport: T,
        config: SessionConfig,
        registry: Arc<PresenceRegistry>,
        owns_registry: bool,
    ) -> Self {
        let protocol = PresenceProtocol::new(config.username.clone(), registry);
        let shared = Shared {
            state: Mutex::new(SessionState::Disconnected),
            router: MessageRouter::new(protocol),
            broadcast: config.destinations.broadcast_destination(),
            outbound: sync::RwLock::new(()),
            lost: AtomicBool::new(false),
            on_chat: RwLock::new(None),
            on_presence: RwLock::new(None),
            on_disconnect: RwLock::new(None),
        };

        Self {
            config,
            transport,
            shared: Arc::new(shared),
            owns_registry,
            link: sync::Mutex::new(None),
        }
    }

    pub fn username(&self) -> &Username {
        &self.config.username
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state()
    }

    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        self.shared.router.protocol().registry()
    }

    pub fn online_users(&self) -> BTreeSet<Username> {
        self.registry().snapshot()
    }

    /// Registers the receiver of chat events, replacing any previous one.
    pub fn on_chat_event<F>(&self, callback: F)
    where
        F: Fn(ChatEvent) + Send + Sync + 'static,
    {
        *write_lock(&self.shared.on_chat) = Some(Arc::new(callback));
    }

    /// Registers a callback fired once per inbound presence message. Read
    /// [`ChatSession::online_users`] from it to get the new roster.
    pub fn on_presence_changed<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *write_lock(&self.shared.on_presence) = Some(Arc::new(callback));
    }

    /// Registers a callback fired once when the transport drops a
    /// subscription while the session is still open, e.g. because the broker
    /// went away. `close` still has to be called afterwards.
    pub fn on_disconnected<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *write_lock(&self.shared.on_disconnect) = Some(Arc::new(callback));
    }

    /// Connects, subscribes to the broadcast and private destinations and
    /// announces the user with a `Join` followed by a `SyncRequest`.
    ///
    /// A `close` issued meanwhile waits for this call to settle. Nothing is
    /// announced if the close arrives before the subscriptions are in place.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let mut slot = self.link.lock().await;
        self.shared
            .transition(&[SessionState::Disconnected], SessionState::Connecting, "connect")?;
        info!(user = %self.config.username, address = %self.config.broker_address, "connecting");

        let link = match self.establish().await {
            Ok(link) => link,
            Err(err) => return Err(self.connect_failed(err)),
        };
        if let Err(err) = self.shared.require(SessionState::Connecting, "connect") {
            debug!("session closed while connecting, releasing transport");
            self.release(link, false).await;
            return Err(err);
        }
        if let Err(err) = self.announce_start(&link).await {
            self.release(link, false).await;
            return Err(self.connect_failed(err));
        }

        if let Err(err) =
            self.shared
                .transition(&[SessionState::Connecting], SessionState::Connected, "connect")
        {
            debug!("session closed while announcing, releasing transport");
            self.release(link, true).await;
            return Err(err);
        }
        self.shared.lost.store(false, Ordering::SeqCst);
        *slot = Some(link);

        info!(user = %self.config.username, "connected");
        Ok(())
    }

    pub async fn send_public(&self, text: impl Into<String>) -> Result<(), SessionError> {
        let text = non_empty(text.into())?;
        let connection = self.connection("send a public message").await?;
        connection
            .publish(
                self.shared.broadcast.clone(),
                Envelope::chat(&self.config.username, text),
            )
            .await
            .map_err(SessionError::Send)
    }

    pub async fn send_private(
        &self,
        recipient: &Username,
        text: impl Into<String>,
    ) -> Result<(), SessionError> {
        let text = non_empty(text.into())?;
        let connection = self.connection("send a private message").await?;
        let destination = self.config.destinations.private_destination(recipient);
        debug!(to = %recipient, "sending private message");
        connection
            .publish(destination, Envelope::chat(&self.config.username, text))
            .await
            .map_err(SessionError::Send)
    }

    /// Announces `Leave`, then releases subscriptions and the connection.
    ///
    /// Every step is attempted even if an earlier one fails. A `connect` in
    /// flight is waited for and released before the session reports
    /// `Closed`. Calling `close` again, or on a session that never connected,
    /// does nothing.
    pub async fn close(&self) {
        let previous = {
            let mut state = self.shared.state();
            match *state {
                SessionState::Connected | SessionState::Connecting => {
                    let previous = *state;
                    *state = SessionState::Closing;
                    previous
                }
                other => {
                    debug!(state = ?other, "close ignored");
                    return;
                }
            }
        };
        info!(user = %self.config.username, "closing session");

        let link = self.link.lock().await.take();
        if let Some(link) = link {
            self.release(link, previous == SessionState::Connected).await;
        }
        if self.owns_registry {
            self.registry().clear();
        }

        *self.shared.state() = SessionState::Closed;
        info!(user = %self.config.username, "session closed");
    }

    async fn establish(&self) -> Result<Link<T::Connection>, TransportError> {
        let connection = Arc::new(self.transport.connect(&self.config.broker_address).await?);
        let mut link = Link {
            connection,
            subscriptions: Vec::with_capacity(2),
            deliveries: Vec::with_capacity(2),
        };

        let destinations = [
            self.shared.broadcast.clone(),
            self.config
                .destinations
                .private_destination(&self.config.username),
        ];
        for destination in destinations {
            match link.connection.subscribe(destination).await {
                Ok(subscription) => self.attach(&mut link, subscription),
                Err(err) => {
                    self.release(link, false).await;
                    return Err(err);
                }
            }
        }

        Ok(link)
    }

    fn attach(&self, link: &mut Link<T::Connection>, subscription: Subscription) {
        link.subscriptions.push(subscription.destination().clone());
        let task = deliver(
            Arc::clone(&self.shared),
            Arc::clone(&link.connection),
            subscription,
        );
        link.deliveries.push(tokio::spawn(task));
    }

    async fn announce_start(&self, link: &Link<T::Connection>) -> Result<(), TransportError> {
        for event in self.shared.router.protocol().start() {
            link.connection
                .publish(self.shared.broadcast.clone(), Envelope::presence(&event))
                .await?;
        }
        Ok(())
    }

    /// Tears down in a fixed order: Leave, consumers, then the connection.
    async fn release(&self, link: Link<T::Connection>, announce_leave: bool) {
        let Link {
            connection,
            subscriptions,
            deliveries,
        } = link;

        // Waits out replies already being published and blocks new ones, so
        // nothing from this session follows the Leave.
        let _outbound = self.shared.outbound.write().await;

        if announce_leave {
            let leave = self.shared.router.protocol().shutdown();
            if let Err(error) = connection
                .publish(self.shared.broadcast.clone(), Envelope::presence(&leave))
                .await
            {
                warn!(?error, "failed to announce leave");
            }
        }

        for destination in subscriptions {
            if let Err(error) = connection.unsubscribe(destination.clone()).await {
                debug!(?error, destination = %destination.name, "failed to unsubscribe");
            }
        }
        for task in deliveries {
            task.abort();
            let _ = task.await;
        }

        if let Err(error) = connection.close().await {
            debug!(?error, "failed to close connection");
        }
    }

    fn connect_failed(&self, err: TransportError) -> SessionError {
        warn!(user = %self.config.username, error = ?err, "connect failed");
        let mut state = self.shared.state();
        if *state == SessionState::Connecting {
            *state = SessionState::Disconnected;
        }
        drop(state);
        if self.owns_registry {
            self.registry().clear();
        }
        SessionError::Connection(err)
    }

    async fn connection(
        &self,
        operation: &'static str,
    ) -> Result<Arc<T::Connection>, SessionError> {
        self.shared.require(SessionState::Connected, operation)?;
        let link = self.link.lock().await;
        match link.as_ref() {
            Some(link) => Ok(Arc::clone(&link.connection)),
            None => Err(SessionError::InvalidState {
                operation,
                state: self.state(),
            }),
        }
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(
        &self,
        from: &[SessionState],
        to: SessionState,
        operation: &'static str,
    ) -> Result<(), SessionError> {
        let mut state = self.state();
        if !from.contains(&*state) {
            return Err(SessionError::InvalidState {
                operation,
                state: *state,
            });
        }
        *state = to;
        Ok(())
    }

    fn require(&self, expected: SessionState, operation: &'static str) -> Result<(), SessionError> {
        let state = *self.state();
        if state != expected {
            return Err(SessionError::InvalidState { operation, state });
        }
        Ok(())
    }

    fn accepts_inbound(&self) -> bool {
        matches!(
            *self.state(),
            SessionState::Connecting | SessionState::Connected
        )
    }

    fn notify_chat(&self, event: ChatEvent) {
        let callback = read_lock(&self.on_chat);
        if let Some(callback) = callback {
            callback(event);
        }
    }

    fn notify_presence(&self) {
        let callback = read_lock(&self.on_presence);
        if let Some(callback) = callback {
            callback();
        }
    }

    fn notify_disconnected(&self) {
        if self.lost.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("transport dropped a subscription");
        let callback = read_lock(&self.on_disconnect);
        if let Some(callback) = callback {
            callback();
        }
    }

    async fn answer<C: Connection>(&self, connection: &C, reply: PresenceEvent) {
        let _outbound = self.outbound.read().await;
        if !self.accepts_inbound() {
            debug!("session closing, not answering");
            return;
        }
        if let Err(error) = connection
            .publish(self.broadcast.clone(), Envelope::presence(&reply))
            .await
        {
            warn!(?error, "failed to answer sync request");
        }
    }
}

async fn deliver<C: Connection>(shared: Arc<Shared>, connection: Arc<C>, mut subscription: Subscription) {
    let delivery = subscription.delivery();
    while let Some(envelope) = subscription.recv().await {
        if !shared.accepts_inbound() {
            debug!("session closing, dropping inbound message");
            continue;
        }

        match shared.router.route(delivery, envelope) {
            Ok(Routed::Presence(reaction)) => {
                shared.notify_presence();
                if let Some(reply) = reaction.reply {
                    shared.answer(&*connection, reply).await;
                }
            }
            Ok(Routed::Chat(event)) => shared.notify_chat(event),
            Ok(Routed::Suppressed) => {}
            Err(error) => warn!(%error, ?delivery, "dropping malformed message"),
        }
    }

    debug!(?delivery, "subscription ended");
    if matches!(*shared.state(), SessionState::Connected) {
        shared.notify_disconnected();
    }
}

fn non_empty(text: String) -> Result<String, SessionError> {
    if text.trim().is_empty() {
        return Err(SessionError::EmptyMessage);
    }
    Ok(text)
}

fn read_lock<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
