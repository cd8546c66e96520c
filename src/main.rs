use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use tokio::net::TcpListener;

use ledger::Ledger;

mod client;
mod correlator;
mod ledger;
mod protocol;
mod router;

/// Average speed enforcement server: cameras report plate sightings,
/// dispatchers receive the resulting tickets.
#[derive(Debug, Parser)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:3000")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // connect tracing to stdout
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let ledger = Arc::new(Ledger::new());
    let correlator = correlator::start(ledger.clone());

    let listener = TcpListener::bind(args.listen).await?;
    tracing::info!("server listening on: {}", listener.local_addr()?);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (conn, peer) = accepted?;
                let ledger = ledger.clone();
                let correlator = correlator.clone();
                tokio::spawn(async move {
                    tracing::debug!(%peer, "client connected");
                    if let Err(reason) = client::handle(conn, ledger, correlator).await {
                        tracing::debug!(%peer, "session ended: {:#}", reason);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                return Ok(());
            }
        }
    }
}
