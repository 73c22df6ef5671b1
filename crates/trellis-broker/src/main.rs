#![forbid(unsafe_code)]

//! Trellis broker daemon.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use trellis_broker::{Broker, Relay};

#[derive(Parser, Debug)]
#[command(name = "trellis-broker")]
#[command(about = "Signaling broker for the Trellis mesh")]
struct Args {
    /// TCP listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// STUN/TURN server to advertise, e.g.
    /// "turn:turn.example.org?secret=...&ttl=1h" (repeatable)
    #[arg(long = "relay")]
    relays: Vec<String>,

    /// PEM certificate chain; enables TLS together with --tls-key
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    trellis_common::init_tracing_with_default(&args.log_level);

    let relays = Relay::parse_all(&args.relays)?;
    for relay in &relays {
        info!(url = %relay.url, "advertising relay");
    }

    let tls = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            Some(trellis_broker::tls::acceptor(cert, key).context("failed to set up TLS")?)
        }
        (None, None) => None,
        _ => bail!("--tls-cert and --tls-key must be given together"),
    };

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(listen = %args.listen, tls = tls.is_some(), "broker listening");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        }
    });

    let broker = Broker::new(relays);
    broker.serve(listener, tls, shutdown).await?;

    Ok(())
}
