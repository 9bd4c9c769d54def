use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use presence_chat::{
    broker::Broker,
    cli::{BrokerArgs, Cli, Command},
    client,
};

const DEFAULT_LOG_FILTER: &str = "presence_chat=info";

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn run_broker(args: BrokerArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let broker = Broker::new(listener);
    // The e2e tests read the address from the last word of this line.
    info!("broker listening on {}", broker.local_addr()?);

    broker.run_until_ctrl_c().await.inspect_err(|err| {
        warn!("broker exited with error: {err:?}");
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    match Cli::parse().command {
        Command::Broker(args) => run_broker(args).await,
        Command::Client(args) => client::run(args).await,
    }
}
