//! Observer connection with automatic reconnect.
//!
//! A supervisor task owns the socket. The [`ObserverClient`] handle talks to
//! it over a channel and receives [`ClientEvent`]s on another.

use crate::reconnect::{Backoff, ConnectionState, ReconnectConfig};
use futures_util::{SinkExt, StreamExt};
use lunar_bridge_core::Envelope;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 256;
const REQUEST_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("client closed")]
    Closed,
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Something the caller should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    /// A retry is scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Retries exhausted; the client is done.
    GaveUp,
    Message(Envelope),
}

enum Request {
    Send(String),
    Close,
}

#[derive(Debug, PartialEq, Eq)]
enum Ending {
    Requested,
    Dropped,
}

/// Handle to an observer connection.
#[derive(Clone)]
pub struct ObserverClient {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionState>,
}

impl ObserverClient {
    /// Start connecting to `url`. Must be called inside a tokio runtime.
    pub fn connect(
        url: impl Into<String>,
        config: ReconnectConfig,
    ) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (req_tx, req_rx) = mpsc::channel(REQUEST_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        tokio::spawn(supervise(url.into(), config, req_rx, event_tx, state_tx));

        (
            Self {
                requests: req_tx,
                state: state_rx,
            },
            event_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection is up.
    pub async fn connected(&self) -> Result<(), ClientError> {
        let mut state = self.state.clone();
        state
            .wait_for(ConnectionState::is_connected)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Closed)
    }

    /// Send an envelope. Fails while not connected; nothing is buffered
    /// across reconnects.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), ClientError> {
        if !self.state().is_connected() {
            return Err(ClientError::NotConnected);
        }
        let text = envelope.to_json()?;
        self.requests
            .send(Request::Send(text))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Send a bare `{"command": name}`.
    pub async fn command(&self, name: &str) -> Result<(), ClientError> {
        self.send(&Envelope::command(name)).await
    }

    /// Close the connection and stop reconnecting.
    pub async fn close(&self) {
        let _ = self.requests.send(Request::Close).await;
    }
}

async fn supervise(
    url: String,
    config: ReconnectConfig,
    mut requests: mpsc::Receiver<Request>,
    events: mpsc::Sender<ClientEvent>,
    state: watch::Sender<ConnectionState>,
) {
    let mut backoff = Backoff::new(config);

    loop {
        transition(&state, &events, ConnectionState::Connecting).await;
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!("Connected to {}", url);
                backoff.reset();
                transition(&state, &events, ConnectionState::Connected).await;
                let ending = session(ws, &mut requests, &events).await;
                transition(&state, &events, ConnectionState::Disconnected).await;
                if ending == Ending::Requested {
                    return;
                }
                warn!("Connection to {} lost", url);
            }
            Err(e) => {
                debug!("Connect to {} failed: {}", url, e);
                transition(&state, &events, ConnectionState::Disconnected).await;
            }
        }

        let Some(delay) = backoff.next_delay() else {
            warn!("Giving up on {} after {} attempts", url, backoff.attempt());
            let _ = events.send(ClientEvent::GaveUp).await;
            return;
        };
        let _ = events
            .send(ClientEvent::Reconnecting {
                attempt: backoff.attempt(),
                delay,
            })
            .await;

        // close() cancels a scheduled retry
        let retry = tokio::time::sleep(delay);
        tokio::pin!(retry);
        loop {
            tokio::select! {
                _ = &mut retry => break,
                req = requests.recv() => match req {
                    Some(Request::Send(_)) => debug!("Dropping send while disconnected"),
                    Some(Request::Close) | None => return,
                },
            }
        }
    }
}

async fn transition(
    state: &watch::Sender<ConnectionState>,
    events: &mpsc::Sender<ClientEvent>,
    next: ConnectionState,
) {
    state.send_replace(next);
    let _ = events.send(ClientEvent::StateChanged(next)).await;
}

async fn session(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    requests: &mut mpsc::Receiver<Request>,
    events: &mpsc::Sender<ClientEvent>,
) -> Ending {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match Envelope::parse(text.as_str()) {
                    Ok(envelope) => {
                        if events.send(ClientEvent::Message(envelope)).await.is_err() {
                            // nobody listening any more
                            let _ = sink.close().await;
                            return Ending::Requested;
                        }
                    }
                    Err(e) => warn!("Ignoring unparseable message: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => return Ending::Dropped,
                Some(Err(e)) => {
                    debug!("Read error: {}", e);
                    return Ending::Dropped;
                }
                Some(Ok(_)) => {}
            },
            req = requests.recv() => match req {
                Some(Request::Send(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!("Write error: {}", e);
                        return Ending::Dropped;
                    }
                }
                Some(Request::Close) | None => {
                    let _ = sink.close().await;
                    return Ending::Requested;
                }
            },
        }
    }
}
