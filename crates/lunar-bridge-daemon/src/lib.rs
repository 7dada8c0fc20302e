//! Connection broker and protocol bridge.
//!
//! Relays telemetry and commands between one hardware endpoint and any
//! number of observers:
//! - datagram telemetry frames are decoded and fanned out to observers
//! - duplex peers are classified as hardware or observer from what they send
//! - observer commands are routed to the hardware peer and correlated with
//!   its responses
//! - hardware liveness is inferred from activity and heartbeat markers

pub mod broker;
pub mod classify;
pub mod config;
pub mod correlator;
pub mod heartbeat;
pub mod registry;
pub mod udp;
pub mod ws;

pub use broker::{Broker, BrokerStatus};
pub use config::{BridgeConfig, ConfigError, OverflowPolicy, SubsystemConfig};
pub use correlator::{CommandError, CommandHandle};
pub use registry::ConnectionId;

use std::net::SocketAddr;
use tokio::net::{TcpListener, UdpSocket};

/// A broker with both transports bound, ready to run.
pub struct Bridge {
    config: BridgeConfig,
    broker: Broker,
    udp: UdpSocket,
    ws: TcpListener,
}

impl Bridge {
    /// Bind the datagram and WebSocket listeners.
    pub async fn bind(config: BridgeConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let udp = UdpSocket::bind(config.udp_listen).await?;
        let ws = TcpListener::bind(config.ws_listen).await?;
        let broker = Broker::new(&config);
        Ok(Self {
            config,
            broker,
            udp,
            ws,
        })
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn udp_addr(&self) -> std::io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    pub fn ws_addr(&self) -> std::io::Result<SocketAddr> {
        self.ws.local_addr()
    }

    /// Run until the WebSocket listener fails.
    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!("Telemetry feed on udp://{}", self.udp.local_addr()?);
        tracing::info!("Listening on ws://{}", self.ws.local_addr()?);

        tokio::spawn(udp::serve(self.udp, self.broker.clone()));
        tokio::spawn(heartbeat::watch_hardware(
            self.broker.clone(),
            self.config.hardware_check_interval(),
        ));
        tokio::spawn(heartbeat::watch_subsystems(
            self.broker.clone(),
            self.config.subsystem_check_interval(),
        ));

        ws::serve(self.ws, self.broker).await
    }
}
