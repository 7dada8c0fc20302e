//! Wire types for the lunar bridge.
//!
//! Two transports meet at the bridge: a datagram feed of fixed-layout binary
//! telemetry frames, and duplex connections carrying JSON envelopes. This
//! crate decodes the former and models the latter; it does no I/O.

mod envelope;
mod frame;

pub use envelope::{CommandStatus, Envelope, EnvelopeError, MessageType, Timestamp, unix_millis};
pub use frame::{
    DecodeError, ENVELOPE_SIZE, FRAME_START_MARKER, Frame, TELEMETRY_FRAME_TYPE,
    TELEMETRY_PAYLOAD_SIZE, TelemetryRecord, decode, encode,
};

/// Role a duplex peer plays once classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Nothing interpretable seen yet.
    Unclassified,
    /// The single hardware endpoint.
    Hardware,
    /// Any other peer: dashboards, tooling.
    Observer,
}
