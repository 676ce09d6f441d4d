//! Tether CLI
//!
//! Host a room from the desktop, join one from another machine, and
//! watch messages flow. A thin demonstration shell over the library.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tether::{
    config::PairingUrl, ClientConfig, FileIdentityStore, GuestBridge, IdentityStore,
    MemoryIdentityStore, NullAudioSink, PinPolicy, SessionClient,
};

/// Tether: secure device pairing over LAN or relay
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Relay base URL
    #[arg(short, long)]
    relay: Option<String>,

    /// Path to the identity store (default: ~/.tether/identity.json)
    #[arg(short, long)]
    identity: Option<PathBuf>,

    /// Do not persist identity (fresh device id each run)
    #[arg(long)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the device identity without connecting
    Init,

    /// Display the persisted device id
    Identity,

    /// Host a room (desktop role) and print the pairing link
    Host {
        /// Local-network URL to advertise in the pairing link
        #[arg(long)]
        local: Option<String>,

        /// PIN-policy service consulted for guest access
        #[arg(long)]
        pin_policy: Option<String>,
    },

    /// Join a room (mobile role) with a token or pairing URL
    Join {
        /// Pairing token or full tether:// pairing URL
        token: String,
    },
}

fn default_identity_path() -> PathBuf {
    dirs::home_dir()
        .expect("Could not find home directory")
        .join(".tether")
        .join("identity.json")
}

fn build_store(cli: &Cli) -> Arc<dyn IdentityStore> {
    if cli.ephemeral {
        Arc::new(MemoryIdentityStore::new())
    } else {
        let path = cli
            .identity
            .clone()
            .unwrap_or_else(default_identity_path);
        Arc::new(FileIdentityStore::new(path))
    }
}

fn build_config(cli: &Cli) -> ClientConfig {
    match &cli.relay {
        Some(relay) => ClientConfig::with_relay(relay.clone()),
        None => ClientConfig::default(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tether=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let store = build_store(&cli);
    let config = build_config(&cli);

    match &cli.command {
        Commands::Init => {
            let id = tether::identity::load_or_create_device_id(store.as_ref()).await?;
            println!("Device id: {id}");
        }

        Commands::Identity => {
            match store.load(tether::identity::DEVICE_ID_KEY).await {
                Some(id) => println!("Device id: {id}"),
                None => {
                    eprintln!("No identity yet. Run 'tether init' first.");
                    std::process::exit(1);
                }
            }
        }

        Commands::Host { local, pin_policy } => {
            let client = SessionClient::new(config.clone(), store);

            let policy_url = pin_policy.clone().unwrap_or(config.pin_policy_url.clone());
            let bridge = Arc::new(GuestBridge::new(
                PinPolicy::new(policy_url),
                config.stun_servers.clone(),
                Arc::new(NullAudioSink),
            ));
            client.set_guest_bridge(bridge);

            let token = client.create_room().await?;
            let url = PairingUrl::build(&config.relay_url, &token, local.as_deref());

            println!("Room hosted.");
            println!("Pairing token: {token}");
            println!("Pairing link:  {url}");
            println!();

            watch_session(&client).await;
            client.disconnect().await;
        }

        Commands::Join { token } => {
            let client = SessionClient::new(config, store);

            if token.starts_with("tether://") {
                client.join_with_pairing_url(token).await?;
            } else {
                client.join_with_token(token).await?;
            }

            watch_session(&client).await;
            client.disconnect().await;
        }
    }

    Ok(())
}

/// Print state transitions and incoming messages until ctrl-c
async fn watch_session(client: &SessionClient) {
    let mut state_rx = client.subscribe_state();
    let mut messages = client.subscribe_messages();

    loop {
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow().clone();
                if state.connected {
                    println!(
                        "[registered] {} devices visible",
                        state.connected_devices.len()
                    );
                    for device in &state.connected_devices {
                        println!("  - {} ({}) {}", device.name, device.role, device.device_id);
                    }
                } else if let Some(error) = &state.error {
                    println!("[disconnected] {error}");
                }
            }
            message = messages.recv() => {
                match message {
                    Ok(msg) => {
                        println!("[{}] from {}: {}", msg.kind, msg.source, msg.payload);
                    }
                    Err(_) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down.");
                break;
            }
        }
    }
}
