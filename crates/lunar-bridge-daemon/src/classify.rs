//! Role inference from message shape.
//!
//! Rules are evaluated in order; the first one that matches wins:
//! 1. `type: hardware-hello` is an explicit hardware claim.
//! 2. A bare command (command, no status, no type) claims observer.
//! 3. A status field, or any type other than `hardware-status`, is
//!    inferred hardware traffic.
//!
//! Anything else says nothing about the sender.

use lunar_bridge_core::{Envelope, MessageType};

/// What a single message says about its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    HardwareExplicit,
    HardwareInferred,
    Observer,
}

pub fn classify(envelope: &Envelope) -> Option<Claim> {
    if envelope.kind == Some(MessageType::HardwareHello) {
        return Some(Claim::HardwareExplicit);
    }
    if envelope.is_bare_command() {
        return Some(Claim::Observer);
    }
    let typed_traffic = envelope
        .kind
        .as_ref()
        .is_some_and(|kind| *kind != MessageType::HardwareStatus);
    if envelope.status.is_some() || typed_traffic {
        return Some(Claim::HardwareInferred);
    }
    None
}
