use std::{
    collections::{BTreeSet, HashMap},
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
    sync::{Mutex, mpsc},
};
use tracing::{debug, info, warn};

use crate::message::{
    BrokerToClient, ClientToBroker, Destination, DestinationKind, Envelope, read_message,
    write_message,
};

type ClientId = u64;
type Outbox = mpsc::UnboundedSender<BrokerToClient>;

pub struct Broker {
    listener: TcpListener,
    state: Arc<BrokerState>,
}

impl Broker {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            state: Arc::new(BrokerState::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Broker { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(state: &Arc<BrokerState>) {
    info!("broker shutting down");
    state
        .notify_all(BrokerToClient::Error {
            message: "broker shutting down".to_string(),
        })
        .await;
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<BrokerState>,
) {
    match result {
        Ok((stream, peer)) => spawn_client_handler(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_client_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<BrokerState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, state).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

struct BrokerState {
    routes: Mutex<Routes>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct Routes {
    outboxes: HashMap<ClientId, Outbox>,
    subscribers: HashMap<Destination, BTreeSet<ClientId>>,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            routes: Mutex::new(Routes::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn register_client(&self, outbox: Outbox) -> ClientId {
        let id = self.next_id();
        self.routes.lock().await.outboxes.insert(id, outbox);
        id
    }

    async fn remove_client(&self, id: ClientId) {
        let mut routes = self.routes.lock().await;
        routes.outboxes.remove(&id);
        for subscribers in routes.subscribers.values_mut() {
            subscribers.remove(&id);
        }
        routes.subscribers.retain(|_, subscribers| !subscribers.is_empty());
    }

    async fn subscribe(&self, id: ClientId, destination: Destination) {
        let mut routes = self.routes.lock().await;
        routes.subscribers.entry(destination).or_default().insert(id);
    }

    async fn unsubscribe(&self, id: ClientId, destination: &Destination) {
        let mut routes = self.routes.lock().await;
        if let Some(subscribers) = routes.subscribers.get_mut(destination) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                routes.subscribers.remove(destination);
            }
        }
    }

    /// Routes one published message and returns how many clients received it.
    async fn publish(&self, destination: Destination, message: Envelope) -> usize {
        let routes = self.routes.lock().await;
        let Some(subscribers) = routes.subscribers.get(&destination) else {
            return 0;
        };

        let mut delivered = 0;
        for id in subscribers {
            let Some(outbox) = routes.outboxes.get(id) else {
                continue;
            };
            let frame = BrokerToClient::Deliver {
                destination: destination.clone(),
                message: message.clone(),
            };
            if outbox.send(frame).is_ok() {
                delivered += 1;
                if destination.kind == DestinationKind::Queue {
                    break;
                }
            }
        }
        delivered
    }

    async fn notify_all(&self, message: BrokerToClient) {
        let routes = self.routes.lock().await;
        for outbox in routes.outboxes.values() {
            let _ = outbox.send(message.clone());
        }
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<BrokerState>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let client_id = state.register_client(outbox_tx.clone()).await;
    let writer_task = tokio::spawn(drain_outbox(writer, outbox_rx));
    info!(?peer, client_id, "client connected");

    let result = run_client_session(&state, client_id, &mut reader, &outbox_tx).await;

    state.remove_client(client_id).await;
    drop(outbox_tx);
    let _ = writer_task.await;
    info!(?peer, client_id, "client disconnected");

    result
}

async fn run_client_session<R>(
    state: &BrokerState,
    client_id: ClientId,
    reader: &mut R,
    outbox: &Outbox,
) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        match read_message::<_, ClientToBroker>(reader).await {
            Ok(Some(frame)) => handle_client_message(frame, state, client_id).await,
            Ok(None) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                debug!(client_id, error = ?err, "rejecting malformed frame");
                let _ = outbox.send(BrokerToClient::Error {
                    message: format!("invalid frame: {err}"),
                });
            }
            Err(err) => return Err(err.into()),
        }
    }
}

async fn handle_client_message(frame: ClientToBroker, state: &BrokerState, client_id: ClientId) {
    match frame {
        ClientToBroker::Subscribe { destination } => {
            debug!(client_id, destination = %destination.name, "subscribe");
            state.subscribe(client_id, destination).await;
        }
        ClientToBroker::Unsubscribe { destination } => {
            debug!(client_id, destination = %destination.name, "unsubscribe");
            state.unsubscribe(client_id, &destination).await;
        }
        ClientToBroker::Publish {
            destination,
            message,
        } => {
            let name = destination.name.clone();
            let delivered = state.publish(destination, message).await;
            if delivered == 0 {
                debug!(client_id, destination = %name, "no subscribers, message dropped");
            }
        }
    }
}

async fn drain_outbox(mut writer: OwnedWriteHalf, mut outbox: mpsc::UnboundedReceiver<BrokerToClient>) {
    while let Some(frame) = outbox.recv().await {
        if let Err(err) = write_message(&mut writer, &frame).await {
            debug!(?err, "failed to deliver message to client");
            break;
        }
    }
}
