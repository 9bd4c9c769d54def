//! Client side of the JSON-line broker in [`crate::broker`].

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{self, mpsc},
    task::JoinHandle,
};
use tracing::{debug, warn};

use super::{Connection, Subscription, Transport};
use crate::{
    error::TransportError,
    message::{BrokerToClient, ClientToBroker, Destination, Envelope, read_message, write_message},
};

type Routes = Arc<Mutex<HashMap<Destination, mpsc::UnboundedSender<Envelope>>>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for TcpTransport {
    type Connection = TcpConnection;

    async fn connect(&self, address: &str) -> Result<TcpConnection, TransportError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| TransportError::Unreachable {
                address: address.to_string(),
                source,
            })?;
        debug!(address, "connected to broker");

        let (reader, writer) = stream.into_split();
        let routes = Routes::default();
        let reader = tokio::spawn(demultiplex(BufReader::new(reader), Arc::clone(&routes)));

        Ok(TcpConnection {
            writer: sync::Mutex::new(writer),
            routes,
            reader,
            closed: AtomicBool::new(false),
        })
    }
}

/// Broker connection. One background task reads `deliver` frames and forwards
/// them to the matching subscription.
#[derive(Debug)]
pub struct TcpConnection {
    writer: sync::Mutex<OwnedWriteHalf>,
    routes: Routes,
    reader: JoinHandle<()>,
    closed: AtomicBool,
}

impl TcpConnection {
    fn routes(&self) -> MutexGuard<'_, HashMap<Destination, mpsc::UnboundedSender<Envelope>>> {
        lock_routes(&self.routes)
    }

    async fn send(&self, frame: &ClientToBroker) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) || self.reader.is_finished() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, frame).await?;
        Ok(())
    }
}

impl Connection for TcpConnection {
    async fn subscribe(&self, destination: Destination) -> Result<Subscription, TransportError> {
        // Register the route before the broker can start delivering.
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes().insert(destination.clone(), tx);

        let frame = ClientToBroker::Subscribe {
            destination: destination.clone(),
        };
        if let Err(err) = self.send(&frame).await {
            self.routes().remove(&destination);
            return Err(err);
        }

        Ok(Subscription::new(destination, rx))
    }

    async fn unsubscribe(&self, destination: Destination) -> Result<(), TransportError> {
        self.routes().remove(&destination);
        self.send(&ClientToBroker::Unsubscribe { destination }).await
    }

    async fn publish(&self, destination: Destination, message: Envelope) -> Result<(), TransportError> {
        self.send(&ClientToBroker::Publish {
            destination,
            message,
        })
        .await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.reader.abort();
        self.routes().clear();
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn lock_routes(
    routes: &Routes,
) -> MutexGuard<'_, HashMap<Destination, mpsc::UnboundedSender<Envelope>>> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn demultiplex(mut reader: BufReader<OwnedReadHalf>, routes: Routes) {
    loop {
        match read_message::<_, BrokerToClient>(&mut reader).await {
            Ok(Some(BrokerToClient::Deliver {
                destination,
                message,
            })) => forward(&routes, &destination, message),
            Ok(Some(BrokerToClient::Error { message })) => {
                warn!(%message, "broker reported an error");
            }
            Ok(None) => {
                debug!("broker closed the connection");
                break;
            }
            Err(error) => {
                warn!(?error, "failed to read from broker");
                break;
            }
        }
    }

    // Dropping the senders ends every subscription stream.
    lock_routes(&routes).clear();
}

fn forward(routes: &Routes, destination: &Destination, message: Envelope) {
    let mut routes = lock_routes(routes);
    let Some(tx) = routes.get(destination) else {
        debug!(destination = %destination.name, "delivery for unknown subscription");
        return;
    };
    if tx.send(message).is_err() {
        routes.remove(destination);
    }
}
