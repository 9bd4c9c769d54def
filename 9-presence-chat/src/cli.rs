use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::config::{DEFAULT_BROADCAST, DEFAULT_PRIVATE_PREFIX, DestinationNames};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the pub/sub broker, accepting local TCP connections.
    Broker(BrokerArgs),
    /// Connect to a broker and join the chat room.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Socket address the broker should bind to. Use 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Name shown to other participants; also names your private inbox.
    #[arg(long)]
    pub username: String,

    /// Address of the broker to connect to.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub server: SocketAddr,

    /// Broadcast destination shared by the room.
    #[arg(long, default_value = DEFAULT_BROADCAST)]
    pub public_topic: String,

    /// Prefix of every participant's private destination.
    #[arg(long, default_value = DEFAULT_PRIVATE_PREFIX)]
    pub private_prefix: String,
}

impl ClientArgs {
    pub fn destinations(&self) -> DestinationNames {
        DestinationNames {
            broadcast: self.public_topic.clone(),
            private_prefix: self.private_prefix.clone(),
        }
    }
}
