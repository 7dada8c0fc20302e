//! Bridge daemon.
//!
//! Run with defaults (telemetry on udp 10015, peers on ws 127.0.0.1:8765):
//!   cargo run -p lunar-bridge-daemon --bin lunar-bridge-daemon
//!
//! Or with a config file and overrides:
//!   lunar-bridge-daemon --config bridge.toml --ws 0.0.0.0:8765

use clap::Parser;
use lunar_bridge_daemon::{Bridge, BridgeConfig, OverflowPolicy};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lunar-bridge-daemon", about = "Relay hardware telemetry and commands to observers")]
struct Args {
    /// TOML config file
    #[arg(long, env = "LUNAR_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Datagram telemetry listen address
    #[arg(long, env = "LUNAR_BRIDGE_UDP")]
    udp: Option<SocketAddr>,

    /// WebSocket listen address
    #[arg(long, env = "LUNAR_BRIDGE_WS")]
    ws: Option<SocketAddr>,

    /// Command response timeout (ms)
    #[arg(long, env = "LUNAR_BRIDGE_COMMAND_TIMEOUT_MS")]
    command_timeout_ms: Option<u64>,

    /// Silence after which the hardware peer is considered gone (ms)
    #[arg(long, env = "LUNAR_BRIDGE_HEARTBEAT_TIMEOUT_MS")]
    heartbeat_timeout_ms: Option<u64>,

    /// Per-connection outbound queue length
    #[arg(long, env = "LUNAR_BRIDGE_OUTBOX_CAPACITY")]
    outbox_capacity: Option<usize>,

    /// What to do with a connection whose queue is full
    #[arg(long, value_enum, env = "LUNAR_BRIDGE_OVERFLOW_POLICY")]
    overflow_policy: Option<OverflowPolicy>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::load(path)?,
            None => BridgeConfig::default(),
        };
        if let Some(addr) = self.udp {
            config.udp_listen = addr;
        }
        if let Some(addr) = self.ws {
            config.ws_listen = addr;
        }
        if let Some(ms) = self.command_timeout_ms {
            config.command_timeout_ms = ms;
        }
        if let Some(ms) = self.heartbeat_timeout_ms {
            config.heartbeat_timeout_ms = ms;
        }
        if let Some(capacity) = self.outbox_capacity {
            config.outbox_capacity = capacity;
        }
        if let Some(policy) = self.overflow_policy {
            config.overflow_policy = policy;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("lunar_bridge_daemon=info".parse()?),
        )
        .init();

    let config = Args::parse().into_config()?;
    tracing::info!(
        "Starting bridge: command timeout {:?}, heartbeat timeout {:?}, {} subsystem(s)",
        config.command_timeout(),
        config.heartbeat_timeout(),
        config.subsystems.len()
    );

    Bridge::bind(config).await?.run().await
}
