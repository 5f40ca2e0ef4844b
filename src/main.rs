//! Tunnelme client
//!
//! A CLI tool for exposing a local TCP service through a
//! localtunnel-style broker: the broker assigns a temporary public
//! subdomain and this client holds the pool of tunnel connections that
//! relay traffic to the local port.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

mod broker;
mod config;
mod error;
mod tunnel;

use config::Config;
use tunnel::TunnelSession;

const DEFAULT_BROKER: &str = "https://localtunnel.me";

#[derive(Parser, Debug)]
#[command(name = "tunnelme")]
#[command(author, version, about = "Expose a local port through a public tunnel broker")]
struct Cli {
    /// Local port to expose
    #[arg(short, long)]
    port: u16,

    /// Requested subdomain (broker picks one if omitted)
    #[arg(short, long)]
    subdomain: Option<String>,

    /// Broker base URL
    #[arg(long, env = "TUNNELME_HOST")]
    host: Option<String>,

    /// Open the public URL in a browser once assigned
    #[arg(long)]
    open: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load().unwrap_or_default();

    // Resolve options: CLI > config file > built-in default
    let host = cli
        .host
        .or(config.broker.host)
        .unwrap_or_else(|| DEFAULT_BROKER.to_string());
    let subdomain = cli
        .subdomain
        .or(config.broker.subdomain)
        .unwrap_or_default();

    let broker = Url::parse(&host).with_context(|| format!("Invalid broker URL: {}", host))?;

    let mut session = TunnelSession::new(broker);
    let url = session
        .negotiate(&subdomain)
        .await
        .context("Failed to negotiate with broker")?;

    println!("your url is: {}", url);
    println!("forwarding to localhost:{}", cli.port);
    println!("Press Ctrl+C to stop the tunnel.");

    if cli.open && open::that(&url).is_err() {
        println!("(Could not open browser automatically)");
    }

    let handle = session.stop_handle();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
        handle.stop();
    });

    session
        .start(cli.port)
        .await
        .context("Failed to start tunnel")?;

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
