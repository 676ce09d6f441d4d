//! Tether relay server
//!
//! Room-based message broker for paired devices and web guests. The
//! relay never sees payload plaintext; enveloped messages route by
//! target only.
//!
//! Usage:
//!   tether-relay [--port 8420] [--host 0.0.0.0] [--public-url https://relay.example.com]

use clap::Parser;
use std::net::SocketAddr;

/// Tether relay server
#[derive(Parser)]
#[command(name = "tether-relay")]
#[command(about = "Message relay for tether device pairing")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8420")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Public base URL baked into minted guest links
    #[arg(long)]
    public_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tether=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    tether::relay::serve(addr, args.public_url).await?;
    Ok(())
}
