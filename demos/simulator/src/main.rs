//! Lunar telemetry simulator.
//!
//! Streams synthetic telemetry frames to a bridge's datagram port, and can
//! also stand in for the hardware peer:
//!   cargo run -p lunar-bridge-simulator -- --rate 5 --scenario anomaly
//!   cargo run -p lunar-bridge-simulator -- --hardware-url ws://127.0.0.1:8765

mod hardware;
mod sensors;

use clap::Parser;
use lunar_bridge_core::encode;
use sensors::{Scenario, SensorModel, mission_clock, orbits};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{MissedTickBehavior, interval};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lunar-simulator", about = "Send synthetic telemetry to a lunar bridge")]
struct Args {
    /// Bridge host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Bridge datagram port
    #[arg(long, default_value_t = 10015)]
    port: u16,

    /// Frames per second
    #[arg(long, default_value_t = 1.0)]
    rate: f64,

    #[arg(long, value_enum, default_value_t = Scenario::Nominal)]
    scenario: Scenario,

    /// Also connect to this bridge URL as the hardware peer
    #[arg(long)]
    hardware_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("lunar_simulator=info".parse()?))
        .init();

    let args = Args::parse();
    if !(args.rate.is_finite() && args.rate > 0.0) {
        anyhow::bail!("--rate must be a positive number");
    }
    let period = Duration::from_secs_f64(1.0 / args.rate);
    let target = format!("{}:{}", args.host, args.port);

    tracing::info!("Sending telemetry to udp://{} at {} Hz", target, args.rate);
    if args.scenario != Scenario::Nominal {
        tracing::info!("Scenario: {:?}", args.scenario);
    }

    if let Some(url) = args.hardware_url {
        tokio::spawn(hardware::run(url));
    }

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let mut model = SensorModel::new(args.scenario);
    let mut rng = rand::thread_rng();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut frames: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopped after {} frames", frames);
                return Ok(());
            }
        }

        let record = model.next(&mut rng);
        if let Err(e) = socket.send_to(&encode(&record), &target).await {
            tracing::warn!("Send failed: {}", e);
            continue;
        }
        frames += 1;

        if frames % 10 == 0 {
            tracing::info!(
                "Mission time {} | orbit {:.2} ({} complete) | thermal {:.2}",
                mission_clock(frames as f64 * period.as_secs_f64()),
                model.orbit_phase(),
                orbits(model.orbit_phase()),
                model.thermal_cycle()
            );
        }
    }
}
