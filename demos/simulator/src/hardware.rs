//! Mock hardware peer: announces itself, acknowledges every command and
//! emits a heartbeat log line.

use futures_util::{SinkExt, StreamExt};
use lunar_bridge_core::{CommandStatus, Envelope, MessageType, unix_millis};
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(2);
const RETRY_DELAY: Duration = Duration::from_secs(3);

/// Stay connected to the bridge as its hardware peer.
pub async fn run(url: String) {
    loop {
        match session(&url).await {
            Ok(()) => tracing::info!("Bridge closed the hardware session"),
            Err(e) => tracing::warn!("Hardware session failed: {}", e),
        }
        sleep(RETRY_DELAY).await;
    }
}

async fn session(url: &str) -> anyhow::Result<()> {
    let (ws, _) = connect_async(url).await?;
    let (mut sink, mut stream) = ws.split();
    tracing::info!("Hardware peer connected to {}", url);

    let hello = Envelope {
        kind: Some(MessageType::HardwareHello),
        ..Envelope::default()
    };
    sink.send(Message::Text(hello.to_json()?.into())).await?;

    let mut heartbeat = interval(HEARTBEAT_PERIOD);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let beat = Envelope {
                    kind: Some(MessageType::Log),
                    message: Some("HEARTBEAT".into()),
                    ..Envelope::default()
                }
                .with_timestamp(unix_millis());
                sink.send(Message::Text(beat.to_json()?.into())).await?;
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = reply_to(text.as_str()) {
                        sink.send(Message::Text(reply.to_json()?.into())).await?;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Acknowledge a command; everything else gets no reply.
pub fn reply_to(text: &str) -> Option<Envelope> {
    let envelope = Envelope::parse(text).ok()?;
    if !envelope.is_bare_command() {
        return None;
    }
    let name = envelope.command.as_deref()?;
    tracing::info!("Executing {}", name);

    let mut reply = Envelope::response(CommandStatus::Success, format!("{name} executed"))
        .with_timestamp(unix_millis());
    reply.id = envelope.id;
    Some(reply)
}
