//! Observer-side client for the lunar bridge.
//!
//! ```ignore
//! let (client, mut events) = ObserverClient::connect("ws://127.0.0.1:8765", ReconnectConfig::default());
//! client.connected().await?;
//! client.command("idle").await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

mod client;
mod reconnect;

pub use client::{ClientError, ClientEvent, ObserverClient};
pub use reconnect::{ConnectionState, ReconnectConfig};
