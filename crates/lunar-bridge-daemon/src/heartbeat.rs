//! Liveness inference.
//!
//! The hardware peer as a whole, and any named subsystem announcing itself
//! through heartbeat markers in log text, is considered connected while it
//! has been seen within the timeout. The monitor is plain data driven by
//! explicit instants; the periodic watch tasks at the bottom drive it
//! through the broker.

use crate::broker::Broker;
use crate::config::SubsystemConfig;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy)]
struct Liveness {
    last_seen: Instant,
    connected: bool,
}

/// A change in a subsystem's reported liveness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Connected(String),
    Disconnected(String),
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    timeout: Duration,
    hardware: Option<Instant>,
    markers: Vec<SubsystemConfig>,
    subsystems: BTreeMap<String, Liveness>,
}

impl HeartbeatMonitor {
    pub fn new(timeout: Duration, markers: Vec<SubsystemConfig>) -> Self {
        Self {
            timeout,
            hardware: None,
            markers,
            subsystems: BTreeMap::new(),
        }
    }

    /// Record hardware activity. Returns true if it was not live before.
    pub fn hardware_seen(&mut self, now: Instant) -> bool {
        self.hardware.replace(now).is_none()
    }

    /// Forget the hardware peer (closed or demoted).
    pub fn hardware_lost(&mut self) {
        self.hardware = None;
    }

    pub fn hardware_connected(&self) -> bool {
        self.hardware.is_some()
    }

    /// True once the hardware peer has been silent longer than the timeout.
    pub fn hardware_expired(&self, now: Instant) -> bool {
        self.hardware
            .is_some_and(|seen| now.saturating_duration_since(seen) > self.timeout)
    }

    /// Subsystems whose marker appears in `text`.
    pub fn matching_subsystems<'a>(&'a self, text: &'a str) -> impl Iterator<Item = &'a str> {
        self.markers
            .iter()
            .filter(move |s| text.contains(s.marker.as_str()))
            .map(|s| s.name.as_str())
    }

    /// Record a subsystem heartbeat.
    pub fn subsystem_seen(&mut self, name: &str, now: Instant) -> Option<Transition> {
        let entry = self.subsystems.entry(name.to_string()).or_insert(Liveness {
            last_seen: now,
            connected: false,
        });
        entry.last_seen = now;
        if entry.connected {
            None
        } else {
            entry.connected = true;
            Some(Transition::Connected(name.to_string()))
        }
    }

    /// Flip every silent subsystem to disconnected.
    pub fn scan_subsystems(&mut self, now: Instant) -> Vec<Transition> {
        let timeout = self.timeout;
        self.subsystems
            .iter_mut()
            .filter(|(_, l)| l.connected && now.saturating_duration_since(l.last_seen) > timeout)
            .map(|(name, l)| {
                l.connected = false;
                Transition::Disconnected(name.clone())
            })
            .collect()
    }

    /// Current subsystem states, by name.
    pub fn subsystems(&self) -> impl Iterator<Item = (&str, bool)> {
        self.subsystems
            .iter()
            .map(|(name, l)| (name.as_str(), l.connected))
    }
}

/// Coarse hardware-wide check.
pub async fn watch_hardware(broker: Broker, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        broker.check_hardware_liveness().await;
    }
}

/// Named-subsystem check.
pub async fn watch_subsystems(broker: Broker, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        broker.check_subsystems().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(15);

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(
            TIMEOUT,
            vec![
                SubsystemConfig::new("link", "HEARTBEAT"),
                SubsystemConfig::new("camera", "CAM_ALIVE"),
            ],
        )
    }

    #[test]
    fn hardware_expires_after_threshold_only() {
        let mut m = monitor();
        let t0 = Instant::now();
        assert!(!m.hardware_expired(t0));

        assert!(m.hardware_seen(t0));
        assert!(!m.hardware_seen(t0));
        assert!(!m.hardware_expired(t0 + TIMEOUT));
        assert!(m.hardware_expired(t0 + TIMEOUT + Duration::from_millis(1)));

        m.hardware_seen(t0 + Duration::from_secs(10));
        assert!(!m.hardware_expired(t0 + TIMEOUT + Duration::from_secs(1)));

        m.hardware_lost();
        assert!(!m.hardware_connected());
        assert!(!m.hardware_expired(t0 + Duration::from_secs(100)));
    }

    #[test]
    fn markers_select_subsystems() {
        let m = monitor();
        let hits: Vec<_> = m.matching_subsystems("[HEARTBEAT] CAM_ALIVE ok").collect();
        assert_eq!(hits, vec!["link", "camera"]);
        assert_eq!(m.matching_subsystems("boot complete").count(), 0);
    }

    #[test]
    fn subsystem_lifecycle() {
        let mut m = monitor();
        let t0 = Instant::now();

        assert_eq!(
            m.subsystem_seen("link", t0),
            Some(Transition::Connected("link".into()))
        );
        assert_eq!(m.subsystem_seen("link", t0 + Duration::from_secs(1)), None);
        assert!(m.scan_subsystems(t0 + Duration::from_secs(10)).is_empty());

        let later = t0 + Duration::from_secs(17);
        assert_eq!(
            m.scan_subsystems(later),
            vec![Transition::Disconnected("link".into())]
        );
        // reported once
        assert!(m.scan_subsystems(later).is_empty());
        assert_eq!(m.subsystems().collect::<Vec<_>>(), vec![("link", false)]);

        assert_eq!(
            m.subsystem_seen("link", later),
            Some(Transition::Connected("link".into()))
        );
    }

    #[test]
    fn subsystems_time_out_independently() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.subsystem_seen("link", t0);
        m.subsystem_seen("camera", t0 + Duration::from_secs(10));

        let changes = m.scan_subsystems(t0 + Duration::from_secs(20));
        assert_eq!(changes, vec![Transition::Disconnected("link".into())]);
    }
}
