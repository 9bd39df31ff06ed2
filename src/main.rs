use std::sync::Arc;

use anyhow::Result;
use callmesh::config::Config;
use callmesh::rtc::{
    LinkConfig, RoomClient, RoomCommand, RoomConfig, RoomEvent, RtcTransportFactory, SignalingLink,
};
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, watch};

#[derive(Parser)]
#[command(name = "callmesh")]
#[command(about = "Mesh voice rooms with end-to-end encrypted chat", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a room and stay connected; stdin lines become chat messages
    Join {
        /// Relay endpoint, e.g. wss://example.com/ws
        #[arg(long)]
        url: String,
        /// Room token
        #[arg(long, default_value = "")]
        token: String,
        /// Display name shown to other participants
        #[arg(long, default_value = "User")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Join { url, token, name } => join_room(url, token, name).await,
    }
}

async fn join_room(url: String, token: String, name: String) -> Result<()> {
    let config = Config::load()?;

    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let (events_tx, mut events_rx) = mpsc::channel(64);
    let (commands_tx, commands_rx) = mpsc::channel(16);
    let (active_tx, active_rx) = watch::channel(true);

    let factory = Arc::new(RtcTransportFactory::new(config.ice.clone()));
    let (client, transport_events_rx) = RoomClient::new(
        RoomConfig::from(&config),
        factory,
        outbound_tx,
        events_tx,
        active_tx,
    );
    println!("Your key fingerprint: {}", client.local_fingerprint());

    let link = SignalingLink::new(
        LinkConfig {
            url,
            token,
            reconnect_delay: config.reconnect_delay(),
        },
        inbound_tx,
        outbound_rx,
        active_rx,
    );

    let link_handle = tokio::spawn(link.run());
    let client_handle = tokio::spawn(client.run(inbound_rx, transport_events_rx, commands_rx));

    commands_tx.send(RoomCommand::Join { name }).await?;

    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events_rx.recv() => {
                match event {
                    Some(event) => {
                        if !print_event(event) {
                            break;
                        }
                    }
                    None => break,
                }
            }
            line = stdin.next_line() => {
                match line? {
                    Some(text) if !text.trim().is_empty() => {
                        commands_tx.send(RoomCommand::Chat { text }).await?;
                    }
                    Some(_) => {}
                    None => {
                        let _ = commands_tx.send(RoomCommand::Leave).await;
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = commands_tx.send(RoomCommand::Leave).await;
                break;
            }
        }
    }

    let _ = client_handle.await;
    let _ = link_handle.await;
    Ok(())
}

/// Prints one room event; returns false once the session is over.
fn print_event(event: RoomEvent) -> bool {
    match event {
        RoomEvent::Welcomed { id, roster } => {
            println!("Joined as {} ({} others present)", id.short(), roster.len().saturating_sub(1));
        }
        RoomEvent::RosterUpdated { roster } => {
            let names: Vec<String> = roster
                .iter()
                .map(|e| {
                    if e.name.is_empty() {
                        e.id.short().to_string()
                    } else {
                        e.name.clone()
                    }
                })
                .collect();
            println!("In room: {}", names.join(", "));
        }
        RoomEvent::PeerJoined { id } => println!("* {} joined", id.short()),
        RoomEvent::PeerLeft { id } => println!("* {} left", id.short()),
        RoomEvent::Chat { from, name, text, .. } => {
            let who = if name.is_empty() {
                from.short().to_string()
            } else {
                name
            };
            println!("<{who}> {text}");
        }
        RoomEvent::KeyFingerprint { peer, fingerprint, rotated } => {
            if rotated {
                println!("! {} changed keys, re-verify: {fingerprint}", peer.short());
            } else {
                println!("* {} key fingerprint: {fingerprint}", peer.short());
            }
        }
        RoomEvent::PeerVerified { peer } => println!("* {} verified", peer.short()),
        RoomEvent::PeerState { peer, state } => println!("* {} audio {state}", peer.short()),
        RoomEvent::RemoteAudio { peer } => println!("* receiving audio from {}", peer.short()),
        RoomEvent::Rejected { reason } => {
            eprintln!("Cannot join: {reason}");
            return false;
        }
    }
    true
}
