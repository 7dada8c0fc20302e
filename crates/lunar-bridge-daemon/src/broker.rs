//! The broker: classification, routing, fan-out, correlation and liveness.
//!
//! All shared state (registry, pending commands, liveness) sits behind one
//! lock, so classification, fan-out membership and correlation are never
//! observed half-applied. Nothing awaits while holding it: outbound traffic
//! goes through per-connection bounded outboxes with `try_send`.

use crate::classify::classify;
use crate::config::{BridgeConfig, OverflowPolicy};
use crate::correlator::{CommandError, CommandHandle, Correlator, Finished};
use crate::heartbeat::{HeartbeatMonitor, Transition};
use crate::registry::{Assignment, ConnectionId, Delivery, Outbound, Registry};
use lunar_bridge_core::{Envelope, Frame, MessageType, Role, TelemetryRecord, decode};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Health surface for status polling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerStatus {
    pub hardware_connected: bool,
    pub observer_count: usize,
    pub connection_count: usize,
    pub pending_commands: usize,
    pub subsystems: BTreeMap<String, bool>,
    pub last_telemetry: Option<TelemetryRecord>,
    pub hardware_addr: Option<SocketAddr>,
    /// Time since the hardware peer last sent anything.
    pub hardware_idle_ms: Option<u64>,
}

/// Shared handle to the broker. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    outbox_capacity: usize,
}

struct State {
    registry: Registry,
    correlator: Correlator,
    monitor: HeartbeatMonitor,
    last_telemetry: Option<TelemetryRecord>,
    policy: OverflowPolicy,
    attach_id: bool,
}

impl Broker {
    pub fn new(config: &BridgeConfig) -> Self {
        let state = State {
            registry: Registry::new(),
            correlator: Correlator::new(config.command_timeout()),
            monitor: HeartbeatMonitor::new(config.heartbeat_timeout(), config.subsystems.clone()),
            last_telemetry: None,
            policy: config.overflow_policy,
            attach_id: config.attach_correlation_id,
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                outbox_capacity: config.outbox_capacity,
            }),
        }
    }

    /// Register a new duplex peer and queue its handshake.
    ///
    /// The returned receiver is the connection's outbox; it closes when the
    /// broker drops the connection.
    pub async fn accept(&self, addr: SocketAddr) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.inner.outbox_capacity);
        let mut state = self.inner.state.lock().await;
        let id = state.registry.register(addr, tx, Instant::now());

        let handshake = Envelope::hardware_status(state.monitor.hardware_connected(), None, None);
        state.unicast(id, &handshake);
        if let Some(record) = state.last_telemetry {
            state.unicast(id, &Envelope::telemetry(&record));
        }

        info!("Peer {} connected from {}", id, addr);
        (id, rx)
    }

    /// Decode a datagram and fan it out.
    pub async fn ingest_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let frame = match decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping {}-byte datagram from {}: {}", bytes.len(), from, e);
                return;
            }
        };

        let mut state = self.inner.state.lock().await;
        let envelope = match frame {
            Frame::Telemetry(record) => {
                state.last_telemetry = Some(record);
                Envelope::telemetry(&record)
            }
            Frame::Other {
                frame_type,
                payload,
            } => {
                debug!("Forwarding frame type {:#04x} from {}", frame_type, from);
                Envelope::raw_frame(frame_type, &payload)
            }
        };
        state.fan_out(&envelope);
    }

    /// Handle one message from a duplex peer.
    pub async fn ingest_peer_message(&self, id: ConnectionId, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed envelope from {}: {}", id, e);
                return;
            }
        };

        let now = Instant::now();
        let mut state = self.inner.state.lock().await;
        if state.registry.get(id).is_none() {
            debug!("Message from unregistered connection {}", id);
            return;
        }

        match state.registry.apply(id, classify(&envelope)) {
            Assignment::BecameHardware { displaced } => {
                if let Some(old) = displaced {
                    warn!("Hardware peer {} ({}) replaced by {}", old.id, old.addr, id);
                    state.fail_pending(CommandError::ConnectionLost);
                }
                info!("Hardware peer is {}", id);
                state.monitor.hardware_seen(now);
                state.fan_out(&Envelope::hardware_status(true, None, None));
            }
            Assignment::BecameObserver => info!("Observer {} classified", id),
            Assignment::SlotTaken => {
                warn!("Hardware traffic from second peer {}, dropped", id);
                return;
            }
            Assignment::Unchanged(_) => {}
        }
        state.registry.touch(id, now);

        let role = state
            .registry
            .get(id)
            .map_or(Role::Unclassified, |conn| conn.role);
        match role {
            Role::Hardware => state.hardware_message(text, &envelope, now),
            Role::Observer if envelope.is_bare_command() => {
                let mut command = envelope;
                let timeout = requested_timeout(&mut command);
                debug!(
                    "Routing command {:?} from observer {}",
                    command.command.as_deref().unwrap_or_default(),
                    id
                );
                // outcome reaches the observer through its outbox
                let _ = state.dispatch(self, Some(id), command, timeout, now);
            }
            Role::Observer => debug!("Ignoring non-command message from observer {}", id),
            Role::Unclassified => debug!("Uninterpretable message from unclassified peer {}", id),
        }
    }

    /// A duplex peer went away.
    pub async fn on_peer_closed(&self, id: ConnectionId) {
        let mut state = self.inner.state.lock().await;
        if state.drop_connection(id, "connection-closed") {
            info!("Peer {} disconnected", id);
        }
    }

    /// Send a command to the hardware peer on behalf of a local caller.
    pub async fn send_command(&self, command: Envelope, timeout: Option<Duration>) -> CommandHandle {
        let mut state = self.inner.state.lock().await;
        state.dispatch(self, None, command, timeout, Instant::now())
    }

    /// Fail a pending command whose deadline passed.
    pub async fn expire(&self, key: &str) {
        let mut state = self.inner.state.lock().await;
        if let Some(done) = state.correlator.expire(key, Instant::now()) {
            state.report_failure(&done);
        }
    }

    /// Queue a message for every non-hardware connection.
    pub async fn fan_out(&self, envelope: &Envelope) {
        self.inner.state.lock().await.fan_out(envelope);
    }

    /// Queue a message for one connection.
    pub async fn unicast(&self, id: ConnectionId, envelope: &Envelope) -> bool {
        self.inner.state.lock().await.unicast(id, envelope)
    }

    /// Demote a hardware peer that has gone quiet.
    pub async fn check_hardware_liveness(&self) {
        let mut state = self.inner.state.lock().await;
        if !state.monitor.hardware_expired(Instant::now()) {
            return;
        }
        match state.registry.hardware_id() {
            Some(id) => {
                state.drop_connection(id, "heartbeat-timeout");
            }
            None => state.hardware_loss("heartbeat-timeout"),
        }
    }

    /// Report subsystems that have gone quiet.
    pub async fn check_subsystems(&self) {
        let mut state = self.inner.state.lock().await;
        for transition in state.monitor.scan_subsystems(Instant::now()) {
            state.notify(&transition);
        }
    }

    pub async fn status(&self) -> BrokerStatus {
        let state = self.inner.state.lock().await;
        let hardware = state.registry.hardware();
        BrokerStatus {
            hardware_connected: state.monitor.hardware_connected(),
            observer_count: state.registry.observer_count(),
            connection_count: state.registry.len(),
            pending_commands: state.correlator.len(),
            subsystems: state
                .monitor
                .subsystems()
                .map(|(name, up)| (name.to_string(), up))
                .collect(),
            last_telemetry: state.last_telemetry,
            hardware_addr: hardware.map(|conn| conn.addr),
            hardware_idle_ms: hardware.map(|conn| conn.last_activity.elapsed().as_millis() as u64),
        }
    }
}

impl State {
    fn hardware_message(&mut self, text: &str, envelope: &Envelope, now: Instant) {
        self.monitor.hardware_seen(now);
        self.fan_out_text(Arc::from(text));

        if envelope.status.is_some()
            && let Some(done) = self.correlator.resolve(envelope, now)
        {
            debug!("Command {} resolved ({} pending)", done.key, self.correlator.len());
        }

        if matches!(envelope.kind, Some(MessageType::Log | MessageType::Text))
            && let Some(line) = envelope.text()
        {
            let seen: Vec<String> = self
                .monitor
                .matching_subsystems(line)
                .map(str::to_string)
                .collect();
            for name in seen {
                if let Some(transition) = self.monitor.subsystem_seen(&name, now) {
                    self.notify(&transition);
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        broker: &Broker,
        origin: Option<ConnectionId>,
        command: Envelope,
        timeout: Option<Duration>,
        now: Instant,
    ) -> CommandHandle {
        let Some(hardware) = self.registry.hardware_id() else {
            self.reject(origin, &command, CommandError::NoHardwarePeer);
            return CommandHandle::failed(CommandError::NoHardwarePeer);
        };

        let registered = match self.correlator.register(&command, origin, timeout, now) {
            Ok(registered) => registered,
            Err(e) => {
                self.reject(origin, &command, e.clone());
                return CommandHandle::failed(e);
            }
        };

        let key = registered.key.clone();
        let expiry = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(registered.deadline).await;
            expiry.expire(&key).await;
        });

        let mut forward = command;
        if self.attach_id {
            forward.id = Some(registered.key.clone());
        }
        if let Some(text) = encode(&forward) {
            self.unicast_text(hardware, text);
        }
        registered.handle
    }

    /// Tell the issuing observer its command never got a pending slot.
    fn reject(&mut self, origin: Option<ConnectionId>, command: &Envelope, error: CommandError) {
        match origin {
            Some(origin) => debug!("Command from {} rejected: {}", origin, error),
            None => debug!("Local command rejected: {}", error),
        }
        if let Some(origin) = origin {
            let mut reply = Envelope::error(error.to_string());
            reply.command = command.command.clone();
            reply.id = command.id.clone();
            self.unicast(origin, &reply);
        }
    }

    /// Tell the issuing observer its pending command failed.
    fn report_failure(&mut self, done: &Finished) {
        let (Some(origin), Some(error)) = (done.origin, &done.error) else {
            return;
        };
        let mut reply = Envelope::error(error.to_string()).with_id(done.key.clone());
        reply.command = Some(done.command.clone());
        self.unicast(origin, &reply);
    }

    fn fail_pending(&mut self, error: CommandError) {
        for done in self.correlator.fail_all(error) {
            self.report_failure(&done);
        }
    }

    /// Side effects of losing the hardware peer.
    fn hardware_loss(&mut self, reason: &str) {
        if let Some(id) = self.registry.hardware_id() {
            self.registry.remove(id);
        }
        self.monitor.hardware_lost();
        self.fail_pending(CommandError::ConnectionLost);
        warn!("Hardware peer lost: {}", reason);
        self.fan_out(&Envelope::hardware_status(false, None, Some(reason)));
    }

    /// Remove a connection, running hardware-loss side effects if needed.
    /// Returns false if it was already gone.
    fn drop_connection(&mut self, id: ConnectionId, reason: &str) -> bool {
        let Some(conn) = self.registry.remove(id) else {
            return false;
        };
        if conn.role == Role::Hardware {
            info!("Hardware peer {} ({}) dropped", id, conn.addr);
            self.hardware_loss(reason);
        } else {
            debug!("Connection {} ({}) dropped: {}", id, conn.addr, reason);
        }
        true
    }

    fn notify(&mut self, transition: &Transition) {
        let envelope = match transition {
            Transition::Connected(name) => {
                info!("Subsystem {} alive", name);
                Envelope::hardware_status(true, Some(name), None)
            }
            Transition::Disconnected(name) => {
                warn!("Subsystem {} silent", name);
                Envelope::hardware_status(false, Some(name), Some("heartbeat-timeout"))
            }
        };
        self.fan_out(&envelope);
    }

    fn fan_out(&mut self, envelope: &Envelope) {
        if let Some(text) = encode(envelope) {
            self.fan_out_text(text);
        }
    }

    fn fan_out_text(&mut self, text: Outbound) {
        let mut stalled = Vec::new();
        for conn in self.registry.fan_out_targets() {
            match conn.deliver(text.clone(), self.policy) {
                Delivery::Queued => {}
                Delivery::Dropped => warn!("Outbox of {} full, message dropped", conn.id),
                Delivery::Overflowed | Delivery::Closed => stalled.push((conn.id, conn.addr)),
            }
        }
        for (id, addr) in stalled {
            warn!("Outbox of {} ({}) stalled, disconnecting", id, addr);
            self.drop_connection(id, "outbox-overflow");
        }
    }

    fn unicast(&mut self, id: ConnectionId, envelope: &Envelope) -> bool {
        match encode(envelope) {
            Some(text) => self.unicast_text(id, text),
            None => false,
        }
    }

    fn unicast_text(&mut self, id: ConnectionId, text: Outbound) -> bool {
        let Some(conn) = self.registry.get(id) else {
            return false;
        };
        let addr = conn.addr;
        match conn.deliver(text, self.policy) {
            Delivery::Queued => true,
            Delivery::Dropped => {
                warn!("Outbox of {} full, message dropped", id);
                false
            }
            Delivery::Overflowed | Delivery::Closed => {
                warn!("Outbox of {} ({}) stalled, disconnecting", id, addr);
                self.drop_connection(id, "outbox-overflow");
                false
            }
        }
    }
}

/// Per-command deadline an observer asked for with `timeout_ms`. The field
/// is for the bridge and is not forwarded.
fn requested_timeout(command: &mut Envelope) -> Option<Duration> {
    let millis = command.extra.remove("timeout_ms")?.as_u64()?;
    (millis > 0).then(|| Duration::from_millis(millis))
}

fn encode(envelope: &Envelope) -> Option<Outbound> {
    match envelope.to_json() {
        Ok(text) => Some(text.into()),
        Err(e) => {
            warn!("Failed to serialize envelope: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubsystemConfig;
    use lunar_bridge_core::{CommandStatus, encode as encode_frame};

    fn addr() -> SocketAddr {
        ([127, 0, 0, 1], 40000).into()
    }

    fn broker() -> Broker {
        Broker::new(&BridgeConfig {
            subsystems: vec![SubsystemConfig::new("link", "HEARTBEAT")],
            ..BridgeConfig::default()
        })
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(Envelope::parse(&text).unwrap());
        }
        out
    }

    fn connected(envelope: &Envelope) -> Option<bool> {
        (envelope.kind == Some(MessageType::HardwareStatus))
            .then(|| envelope.payload.as_ref()?["connected"].as_bool())
            .flatten()
    }

    async fn hardware(broker: &Broker) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let (id, mut rx) = broker.accept(addr()).await;
        broker
            .ingest_peer_message(id, r#"{"type":"hardware-hello"}"#)
            .await;
        drain(&mut rx);
        (id, rx)
    }

    async fn observer(broker: &Broker) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let (id, mut rx) = broker.accept(addr()).await;
        drain(&mut rx);
        (id, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_reports_liveness_and_cached_telemetry() {
        let broker = broker();
        let (_id, mut first) = broker.accept(addr()).await;
        let hello = drain(&mut first);
        assert_eq!(hello.len(), 1);
        assert_eq!(connected(&hello[0]), Some(false));

        broker
            .ingest_datagram(&encode_frame(&TelemetryRecord::default()), addr())
            .await;
        let _hw = hardware(&broker).await;

        let (_id, mut second) = broker.accept(addr()).await;
        let hello = drain(&mut second);
        assert_eq!(connected(&hello[0]), Some(true));
        assert_eq!(hello[1].kind, Some(MessageType::Telemetry));
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_reaches_observers_not_hardware() {
        let broker = broker();
        let (_hw, mut hw_rx) = hardware(&broker).await;
        let (_obs, mut obs_rx) = observer(&broker).await;

        let record = TelemetryRecord {
            icm_temp: -95,
            ..TelemetryRecord::default()
        };
        broker.ingest_datagram(&encode_frame(&record), addr()).await;

        let got = drain(&mut obs_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload.as_ref().unwrap()["icm_temp"], -95);
        assert!(drain(&mut hw_rx).is_empty());
        assert_eq!(broker.status().await.last_telemetry, Some(record));
    }

    #[tokio::test(start_paused = true)]
    async fn bad_datagrams_are_dropped() {
        let broker = broker();
        let (_obs, mut rx) = observer(&broker).await;
        broker.ingest_datagram(&[0x12, 0x06, 1, 2], addr()).await;
        broker.ingest_datagram(&[0x55, 0x06], addr()).await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(broker.status().await.last_telemetry, None);
    }

    #[tokio::test(start_paused = true)]
    async fn other_frames_go_out_raw() {
        let broker = broker();
        let (_obs, mut rx) = observer(&broker).await;
        broker.ingest_datagram(&[0x12, 0x09, 7, 8], addr()).await;
        let got = drain(&mut rx);
        assert_eq!(got[0].kind, Some(MessageType::RawFrame));
        assert_eq!(got[0].payload.as_ref().unwrap()["frame_type"], 9);
    }

    #[tokio::test(start_paused = true)]
    async fn hardware_classification_notifies_observers() {
        let broker = broker();
        let (_obs, mut obs_rx) = observer(&broker).await;
        let (hw, _hw_rx) = broker.accept(addr()).await;

        broker
            .ingest_peer_message(hw, r#"{"type":"log","message":"boot"}"#)
            .await;

        let got = drain(&mut obs_rx);
        assert_eq!(connected(&got[0]), Some(true));
        assert_eq!(got[1].kind, Some(MessageType::Log));
        assert!(broker.status().await.hardware_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn unsolicited_status_is_fanned_out() {
        let broker = broker();
        let (hw, _hw_rx) = hardware(&broker).await;
        let (_obs, mut obs_rx) = observer(&broker).await;

        let text = r#"{"status":"success","message":"ok"}"#;
        broker.ingest_peer_message(hw, text).await;

        let got = drain(&mut obs_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message.as_deref(), Some("ok"));
        assert_eq!(broker.status().await.pending_commands, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn observer_command_roundtrip() {
        let broker = broker();
        let (hw, mut hw_rx) = hardware(&broker).await;
        let (obs, mut obs_rx) = observer(&broker).await;

        broker.ingest_peer_message(obs, r#"{"command":"idle"}"#).await;
        let forwarded = drain(&mut hw_rx);
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].command.as_deref(), Some("idle"));
        assert!(forwarded[0].id.as_deref().unwrap().starts_with("idle:"));
        assert_eq!(broker.status().await.pending_commands, 1);
        assert_eq!(broker.status().await.observer_count, 1);

        broker
            .ingest_peer_message(hw, r#"{"status":"success","message":"idle executed"}"#)
            .await;
        let got = drain(&mut obs_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message.as_deref(), Some("idle executed"));
        assert_eq!(broker.status().await.pending_commands, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn local_command_resolves_with_payload() {
        let broker = broker();
        let (hw, _hw_rx) = hardware(&broker).await;

        let handle = broker.send_command(Envelope::command("idle"), None).await;
        broker
            .ingest_peer_message(hw, r#"{"status":"success","message":"idle executed"}"#)
            .await;
        let reply = handle.await.unwrap();
        assert_eq!(reply.status, Some(CommandStatus::Success));
        assert_eq!(reply.message.as_deref(), Some("idle executed"));
    }

    #[tokio::test(start_paused = true)]
    async fn no_hardware_fails_immediately() {
        let broker = broker();
        let (obs, mut obs_rx) = observer(&broker).await;

        let start = Instant::now();
        let err = broker
            .send_command(Envelope::command("idle"), None)
            .await
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::NoHardwarePeer);
        assert_eq!(start.elapsed(), Duration::ZERO);

        broker.ingest_peer_message(obs, r#"{"command":"idle"}"#).await;
        let got = drain(&mut obs_rx);
        assert_eq!(got[0].status, Some(CommandStatus::Error));
        assert_eq!(got[0].command.as_deref(), Some("idle"));
        assert_eq!(broker.status().await.pending_commands, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_at_deadline_not_before() {
        let broker = broker();
        let (_hw, _hw_rx) = hardware(&broker).await;

        let start = Instant::now();
        let handle = broker.send_command(Envelope::command("idle"), None).await;
        let err = handle.await.unwrap_err();
        assert!(matches!(err, CommandError::CommandTimeout { .. }));
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(broker.status().await.pending_commands, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn observer_hears_about_its_timeout() {
        let broker = broker();
        let (_hw, _hw_rx) = hardware(&broker).await;
        let (obs, mut obs_rx) = observer(&broker).await;

        broker
            .ingest_peer_message(obs, r#"{"command":"scan","id":"req-7"}"#)
            .await;
        tokio::time::sleep(Duration::from_secs(11)).await;

        let got = drain(&mut obs_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].status, Some(CommandStatus::Error));
        assert_eq!(got[0].id.as_deref(), Some("req-7"));
    }

    #[tokio::test(start_paused = true)]
    async fn hardware_close_fails_pending_and_notifies() {
        let broker = broker();
        let (hw, _hw_rx) = hardware(&broker).await;
        let (_obs, mut obs_rx) = observer(&broker).await;

        let handle = broker.send_command(Envelope::command("idle"), None).await;
        broker.on_peer_closed(hw).await;

        assert_eq!(handle.await, Err(CommandError::ConnectionLost));
        let got = drain(&mut obs_rx);
        assert_eq!(connected(&got[0]), Some(false));
        let status = broker.status().await;
        assert!(!status.hardware_connected);
        assert_eq!(status.connection_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_hardware_is_demoted() {
        let broker = broker();
        let (_hw, mut hw_rx) = hardware(&broker).await;
        let (_obs, mut obs_rx) = observer(&broker).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        broker.check_hardware_liveness().await;
        assert!(broker.status().await.hardware_connected);

        tokio::time::advance(Duration::from_secs(6)).await;
        broker.check_hardware_liveness().await;

        let got = drain(&mut obs_rx);
        assert_eq!(connected(&got[0]), Some(false));
        assert_eq!(got[0].payload.as_ref().unwrap()["reason"], "heartbeat-timeout");
        assert!(!broker.status().await.hardware_connected);
        // outbox closed so the writer shuts the socket
        assert!(matches!(
            hw_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn activity_keeps_hardware_alive() {
        let broker = broker();
        let (hw, _hw_rx) = hardware(&broker).await;
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(10)).await;
            broker.ingest_peer_message(hw, r#"{"type":"generic"}"#).await;
            broker.check_hardware_liveness().await;
        }
        assert!(broker.status().await.hardware_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn subsystem_markers_drive_notifications() {
        let broker = broker();
        let (hw, _hw_rx) = hardware(&broker).await;
        let (_obs, mut obs_rx) = observer(&broker).await;

        broker
            .ingest_peer_message(hw, r#"{"type":"log","message":"[HEARTBEAT] link ok"}"#)
            .await;
        let got = drain(&mut obs_rx);
        // verbatim log, then the subsystem coming up
        assert_eq!(got[0].kind, Some(MessageType::Log));
        assert_eq!(connected(&got[1]), Some(true));
        assert_eq!(got[1].payload.as_ref().unwrap()["subsystem"], "link");

        tokio::time::advance(Duration::from_secs(16)).await;
        broker.check_subsystems().await;
        let got = drain(&mut obs_rx);
        assert_eq!(connected(&got[0]), Some(false));
        assert!(!broker.status().await.subsystems["link"]);
    }

    #[tokio::test(start_paused = true)]
    async fn second_hello_replaces_hardware() {
        let broker = broker();
        let (old, mut old_rx) = hardware(&broker).await;
        let handle = broker.send_command(Envelope::command("idle"), None).await;
        drain(&mut old_rx);

        let (new, _new_rx) = broker.accept(addr()).await;
        broker
            .ingest_peer_message(new, r#"{"type":"hardware-hello"}"#)
            .await;

        assert_eq!(handle.await, Err(CommandError::ConnectionLost));
        assert!(matches!(
            old_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        // the displaced peer is gone; its messages are ignored
        broker.ingest_peer_message(old, r#"{"type":"log"}"#).await;
        assert_eq!(broker.status().await.connection_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inferred_hardware_does_not_steal_the_slot() {
        let broker = broker();
        let (_hw, _hw_rx) = hardware(&broker).await;
        let (_obs, mut obs_rx) = observer(&broker).await;
        let (intruder, _rx) = broker.accept(addr()).await;

        broker
            .ingest_peer_message(intruder, r#"{"status":"success"}"#)
            .await;
        assert!(drain(&mut obs_rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_envelopes_are_dropped() {
        let broker = broker();
        let (id, _rx) = broker.accept(addr()).await;
        broker.ingest_peer_message(id, "not json").await;
        broker.ingest_peer_message(id, "[]").await;
        broker.ingest_peer_message(id, r#"{"command":"idle"}"#).await;
        assert_eq!(broker.status().await.observer_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_observer_is_disconnected() {
        let broker = Broker::new(&BridgeConfig {
            outbox_capacity: 2,
            ..BridgeConfig::default()
        });
        // handshake occupies one slot
        let (_slow, mut slow_rx) = broker.accept(addr()).await;
        let (_fast, mut fast_rx) = observer(&broker).await;

        let frame = encode_frame(&TelemetryRecord::default());
        for _ in 0..3 {
            broker.ingest_datagram(&frame, addr()).await;
            drain(&mut fast_rx);
        }

        assert_eq!(broker.status().await.connection_count, 1);
        // what was queued is still readable, then the channel is closed
        assert_eq!(drain(&mut slow_rx).len(), 2);
        assert!(matches!(
            slow_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn hardware_order_is_preserved_per_observer() {
        let broker = broker();
        let (hw, _hw_rx) = hardware(&broker).await;
        let (_obs, mut obs_rx) = observer(&broker).await;

        for i in 0..20 {
            let text = format!(r#"{{"type":"text","message":"line {i}"}}"#);
            broker.ingest_peer_message(hw, &text).await;
        }
        let lines: Vec<_> = drain(&mut obs_rx)
            .into_iter()
            .filter_map(|e| e.message)
            .collect();
        let expected: Vec<_> = (0..20).map(|i| format!("line {i}")).collect();
        assert_eq!(lines, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_command_does_not_stall_uncorrelated_replies() {
        let broker = Broker::new(&BridgeConfig {
            attach_correlation_id: false,
            ..BridgeConfig::default()
        });
        let (hw, mut hw_rx) = hardware(&broker).await;

        // hardware never answers this one
        let lost = broker.send_command(Envelope::command("unsupported"), None).await;
        assert!(matches!(lost.await, Err(CommandError::CommandTimeout { .. })));
        drain(&mut hw_rx);

        for name in ["idle", "scan", "park"] {
            let handle = broker.send_command(Envelope::command(name), None).await;
            let forwarded = drain(&mut hw_rx);
            assert_eq!(forwarded[0].command.as_deref(), Some(name));
            assert_eq!(forwarded[0].id, None);

            let reply = format!(r#"{{"status":"success","message":"{name} executed"}}"#);
            broker.ingest_peer_message(hw, &reply).await;
            assert_eq!(
                handle.await.unwrap().message,
                Some(format!("{name} executed"))
            );
        }
        assert_eq!(broker.status().await.pending_commands, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fractional_timestamps_and_numeric_ids_are_routed() {
        let broker = broker();
        let (hw, mut hw_rx) = hardware(&broker).await;
        let (obs, mut obs_rx) = observer(&broker).await;

        broker
            .ingest_peer_message(
                hw,
                r#"{"type":"log","message":"HEARTBEAT","timestamp":1718000000.25}"#,
            )
            .await;
        let got = drain(&mut obs_rx);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].kind, Some(MessageType::Log));
        assert_eq!(got[1].payload.as_ref().unwrap()["subsystem"], "link");

        broker
            .ingest_peer_message(obs, r#"{"command":"idle","id":7}"#)
            .await;
        let forwarded = drain(&mut hw_rx);
        assert_eq!(forwarded[0].id.as_deref(), Some("7"));
        assert_eq!(broker.status().await.pending_commands, 1);

        broker
            .ingest_peer_message(hw, r#"{"status":"success","message":"idle executed","id":7}"#)
            .await;
        let got = drain(&mut obs_rx);
        assert_eq!(got[0].message.as_deref(), Some("idle executed"));
        assert_eq!(broker.status().await.pending_commands, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sets_its_own_deadline() {
        let broker = broker();
        let (_hw, mut hw_rx) = hardware(&broker).await;
        let (obs, mut obs_rx) = observer(&broker).await;

        broker
            .ingest_peer_message(obs, r#"{"command":"scan","id":"short","timeout_ms":2000}"#)
            .await;
        broker
            .ingest_peer_message(obs, r#"{"command":"park","id":"long","timeout_ms":30000}"#)
            .await;
        let forwarded = drain(&mut hw_rx);
        assert_eq!(forwarded.len(), 2);
        assert!(forwarded.iter().all(|f| !f.extra.contains_key("timeout_ms")));

        tokio::time::sleep(Duration::from_millis(2100)).await;
        let got = drain(&mut obs_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].status, Some(CommandStatus::Error));
        assert_eq!(got[0].id.as_deref(), Some("short"));

        // well past the configured default, still waiting
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(drain(&mut obs_rx).is_empty());
        assert_eq!(broker.status().await.pending_commands, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_hardware_endpoint_and_idle_time() {
        let broker = broker();
        assert_eq!(broker.status().await.hardware_addr, None);
        assert_eq!(broker.status().await.hardware_idle_ms, None);

        let hw_addr: SocketAddr = ([10, 0, 0, 7], 5555).into();
        let (hw, _rx) = broker.accept(hw_addr).await;
        broker
            .ingest_peer_message(hw, r#"{"type":"hardware-hello"}"#)
            .await;

        tokio::time::advance(Duration::from_millis(1500)).await;
        let status = broker.status().await;
        assert_eq!(status.hardware_addr, Some(hw_addr));
        assert_eq!(status.hardware_idle_ms, Some(1500));

        broker.ingest_peer_message(hw, r#"{"type":"generic"}"#).await;
        assert_eq!(broker.status().await.hardware_idle_ms, Some(0));
    }
}
