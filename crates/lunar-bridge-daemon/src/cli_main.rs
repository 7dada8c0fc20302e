//! Operator tool for a running bridge.
//!
//!   lunar-bridge status
//!   lunar-bridge command idle --timeout 5
//!   lunar-bridge --url ws://10.0.0.2:8765 watch

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use lunar_bridge_client::{ClientEvent, ObserverClient, ReconnectConfig};
use lunar_bridge_core::{CommandStatus, Envelope, MessageType, unix_millis};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

/// Extra wait after the deadline for the bridge's own timeout report.
const REPLY_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "lunar-bridge", about = "Talk to a running lunar bridge")]
struct Cli {
    /// Bridge WebSocket URL
    #[arg(long, env = "LUNAR_BRIDGE_URL", default_value = "ws://127.0.0.1:8765")]
    url: String,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the hardware link status
    Status,
    /// Send a command and wait for its outcome
    Command {
        name: String,
        /// Seconds to wait for a reply; the bridge uses the same deadline
        #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
        timeout: u64,
    },
    /// Print everything the bridge relays
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("lunar_bridge_client=warn".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Cmd::Status => status(&cli.url).await,
        Cmd::Command { name, timeout } => command(&cli.url, &name, Duration::from_secs(timeout)).await,
        Cmd::Watch => watch(&cli.url).await,
    }
}

/// One-shot connection: no retries.
async fn open(url: &str) -> anyhow::Result<(ObserverClient, mpsc::Receiver<ClientEvent>)> {
    let (client, events) = ObserverClient::connect(
        url,
        ReconnectConfig {
            max_attempts: 1,
            initial_delay: Duration::from_millis(200),
            ..ReconnectConfig::default()
        },
    );
    timeout(Duration::from_secs(5), client.connected())
        .await
        .with_context(|| format!("timed out connecting to {url}"))?
        .with_context(|| format!("could not connect to {url}"))?;
    Ok((client, events))
}

async fn next_message(events: &mut mpsc::Receiver<ClientEvent>) -> anyhow::Result<Envelope> {
    loop {
        match events.recv().await {
            Some(ClientEvent::Message(envelope)) => return Ok(envelope),
            Some(ClientEvent::GaveUp) | None => bail!("connection closed"),
            Some(_) => {}
        }
    }
}

async fn status(url: &str) -> anyhow::Result<()> {
    let (client, mut events) = open(url).await?;
    // the bridge opens every session with a hardware_status message
    let envelope = timeout(Duration::from_secs(5), async {
        loop {
            let envelope = next_message(&mut events).await?;
            if envelope.kind == Some(MessageType::HardwareStatus) {
                return anyhow::Ok(envelope);
            }
        }
    })
    .await
    .context("no status from bridge")??;

    let connected = envelope
        .payload
        .as_ref()
        .and_then(|p| p.get("connected"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    println!("hardware: {}", if connected { "connected" } else { "disconnected" });
    client.close().await;
    Ok(())
}

/// A command tagged with an id of its own and the deadline the bridge
/// should hold it to.
fn request(name: &str, id: &str, wait: Duration) -> Envelope {
    let mut request = Envelope::command(name).with_id(id);
    request
        .extra
        .insert("timeout_ms".into(), (wait.as_millis() as u64).into());
    request
}

/// Other observers' traffic is relayed to us too; only our id counts.
fn is_reply_to(envelope: &Envelope, id: &str) -> bool {
    envelope.status.is_some() && envelope.id.as_deref() == Some(id)
}

async fn command(url: &str, name: &str, wait: Duration) -> anyhow::Result<()> {
    let (client, mut events) = open(url).await?;
    let id = format!("cli-{}-{}", std::process::id(), unix_millis());
    client.send(&request(name, &id, wait)).await?;

    let reply = timeout(wait + REPLY_GRACE, async {
        loop {
            let envelope = next_message(&mut events).await?;
            if is_reply_to(&envelope, &id) {
                return anyhow::Ok(envelope);
            }
        }
    })
    .await
    .with_context(|| format!("no reply to {name} within {wait:?}"))??;

    client.close().await;
    let message = reply.message.clone().unwrap_or_default();
    match reply.status {
        Some(CommandStatus::Success) => {
            println!("{name}: {message}");
            Ok(())
        }
        _ => bail!("{name} failed: {message}"),
    }
}

async fn watch(url: &str) -> anyhow::Result<()> {
    let (client, mut events) = ObserverClient::connect(url, ReconnectConfig::default());
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::Message(envelope)) => println!("{}", envelope.to_json()?),
                Some(ClientEvent::StateChanged(state)) => eprintln!("[{}]", state.label()),
                Some(ClientEvent::Reconnecting { attempt, delay }) => {
                    eprintln!("[retry {attempt} in {delay:?}]")
                }
                Some(ClientEvent::GaveUp) | None => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                client.close().await;
                return Ok(());
            }
        }
    }
}
