//! Duplex connection adapter over WebSocket.

use crate::broker::Broker;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

/// Accept peers forever, one task each.
pub async fn serve(listener: TcpListener, broker: Broker) -> anyhow::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let broker = broker.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, broker).await {
                tracing::warn!("Connection error from {}: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, broker: Broker) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();
    let (id, mut outbox) = broker.accept(addr).await;

    // Drains the outbox; ends when the broker drops the connection.
    let mut writer = tokio::spawn(async move {
        while let Some(text) = outbox.recv().await {
            if let Err(e) = sink.send(Message::Text(text.to_string().into())).await {
                tracing::debug!("Write to {} failed: {}", addr, e);
                return;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            msg = stream.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => broker.ingest_peer_message(id, &text).await,
                    Message::Binary(data) => match std::str::from_utf8(&data) {
                        Ok(text) => broker.ingest_peer_message(id, text).await,
                        Err(_) => tracing::warn!("Non-UTF-8 binary frame from {}", addr),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }

            // Broker dropped us (demoted, stalled) or the socket died on write.
            _ = &mut writer => break,
        }
    }

    broker.on_peer_closed(id).await;
    tracing::debug!("Connection closed: {}", addr);
    Ok(())
}
