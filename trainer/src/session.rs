//! Per-peer control permission and the pairing window.

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use log::{info, warn};
use serde::Serialize;

/// A connected GATT peer, identified by its Bluetooth address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 6]);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    ConnectedNoControl,
    ControlGranted,
}

/// Connected peers and which one (if any) holds control.
///
/// Holding control is a single `Option`, so two peers can never both have it.
#[derive(Debug, Default)]
pub struct ControlSessions {
    connected: HashSet<PeerId>,
    controller: Option<PeerId>,
}

impl ControlSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the peer was already known.
    pub fn connect(&mut self, peer: PeerId) -> bool {
        let added = self.connected.insert(peer);
        if added {
            info!("Peer {} connected ({} total)", peer, self.connected.len());
        }
        added
    }

    /// Forget a peer and any control it held.
    pub fn disconnect(&mut self, peer: PeerId) -> bool {
        let removed = self.connected.remove(&peer);
        if self.controller == Some(peer) {
            self.controller = None;
            info!("Control released by disconnect of {}", peer);
        }
        if removed {
            info!("Peer {} disconnected ({} remaining)", peer, self.connected.len());
        }
        removed
    }

    /// Grant control to `peer`, returning the peer it was taken from.
    pub fn request_control(&mut self, peer: PeerId) -> Option<PeerId> {
        // A write can only come from a connected peer, even if we missed the event.
        if self.connected.insert(peer) {
            warn!("Control requested by {} with no connection event seen", peer);
        }
        let previous = self.controller.replace(peer);
        match previous {
            Some(prev) if prev != peer => {
                info!("Control granted to {} (revoked from {})", peer, prev);
                Some(prev)
            }
            Some(_) => None,
            None => {
                info!("Control granted to {}", peer);
                None
            }
        }
    }

    pub fn has_control(&self, peer: PeerId) -> bool {
        self.controller == Some(peer)
    }

    pub fn state(&self, peer: PeerId) -> SessionState {
        if self.controller == Some(peer) {
            SessionState::ControlGranted
        } else if self.connected.contains(&peer) {
            SessionState::ConnectedNoControl
        } else {
            SessionState::Disconnected
        }
    }

    pub fn controller(&self) -> Option<PeerId> {
        self.controller
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }
}

/// Discoverable-under-a-different-name window.
#[derive(Debug, Default)]
pub struct PairingWindow {
    deadline: Option<Instant>,
}

impl PairingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the window, or restart it if one is already open.
    /// Returns true when a new window was opened.
    pub fn enter_pairing(&mut self, duration: Duration, now: Instant) -> bool {
        let opened = self.deadline.is_none();
        self.deadline = Some(now + duration);
        if opened {
            info!("Pairing window opened for {:?}", duration);
        } else {
            info!("Pairing window restarted for {:?}", duration);
        }
        opened
    }

    /// A peer connected: close immediately. Returns true if a window closed.
    pub fn on_connect(&mut self) -> bool {
        if self.deadline.take().is_some() {
            info!("Pairing window closed by connection");
            true
        } else {
            false
        }
    }

    /// Close the window once its deadline passes. Returns true on expiry.
    pub fn update(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                info!("Pairing window expired without a connection");
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline
            .map(|d| d.saturating_duration_since(now))
            .unwrap_or_default()
    }

    /// Name to advertise: `base` plus `suffix` while the window is open.
    pub fn advertised_name(&self, base: &str, suffix: &str) -> String {
        if self.is_active() {
            format!("{base}{suffix}")
        } else {
            base.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: PeerId = PeerId([0xAA, 0, 0, 0, 0, 1]);
    const B: PeerId = PeerId([0xBB, 0, 0, 0, 0, 2]);

    #[test]
    fn test_peer_display() {
        assert_eq!(A.to_string(), "AA:00:00:00:00:01");
    }

    #[test]
    fn test_connect_then_request() {
        let mut s = ControlSessions::new();
        assert_eq!(s.state(A), SessionState::Disconnected);
        assert!(s.connect(A));
        assert!(!s.connect(A));
        assert_eq!(s.state(A), SessionState::ConnectedNoControl);
        assert_eq!(s.request_control(A), None);
        assert_eq!(s.state(A), SessionState::ControlGranted);
        assert!(s.has_control(A));
    }

    #[test]
    fn test_second_request_revokes_first() {
        let mut s = ControlSessions::new();
        s.connect(A);
        s.connect(B);
        s.request_control(A);
        assert_eq!(s.request_control(B), Some(A));
        assert_eq!(s.state(A), SessionState::ConnectedNoControl);
        assert_eq!(s.state(B), SessionState::ControlGranted);
        assert_eq!(s.controller(), Some(B));
    }

    #[test]
    fn test_repeat_request_is_not_a_revoke() {
        let mut s = ControlSessions::new();
        s.request_control(A);
        assert_eq!(s.request_control(A), None);
    }

    #[test]
    fn test_disconnect_drops_control() {
        let mut s = ControlSessions::new();
        s.connect(A);
        s.request_control(A);
        assert!(s.disconnect(A));
        assert_eq!(s.controller(), None);
        assert_eq!(s.state(A), SessionState::Disconnected);
        assert_eq!(s.connected_count(), 0);
    }

    #[test]
    fn test_request_from_unseen_peer_registers_it() {
        let mut s = ControlSessions::new();
        s.request_control(B);
        assert_eq!(s.connected_count(), 1);
        assert_eq!(s.state(B), SessionState::ControlGranted);
        // A later connection event for the same peer is not a second peer.
        assert!(!s.connect(B));
        assert_eq!(s.connected_count(), 1);
    }

    #[test]
    fn test_pairing_closed_by_connection() {
        let t0 = Instant::now();
        let mut w = PairingWindow::new();
        assert!(w.enter_pairing(Duration::from_secs(120), t0));
        assert!(w.is_active());
        assert!(!w.update(t0 + Duration::from_secs(9)));

        // Connection at t=10 s closes it right away.
        assert!(w.on_connect());
        assert!(!w.is_active());
        assert_eq!(w.remaining(t0 + Duration::from_secs(10)), Duration::ZERO);
        assert!(!w.update(t0 + Duration::from_secs(120)));
    }

    #[test]
    fn test_pairing_expires_at_deadline() {
        let t0 = Instant::now();
        let mut w = PairingWindow::new();
        w.enter_pairing(Duration::from_secs(120), t0);
        assert!(!w.update(t0 + Duration::from_millis(119_999)));
        assert!(w.is_active());
        assert!(w.update(t0 + Duration::from_secs(120)));
        assert!(!w.is_active());
    }

    #[test]
    fn test_pairing_restart_extends_deadline() {
        let t0 = Instant::now();
        let mut w = PairingWindow::new();
        w.enter_pairing(Duration::from_secs(120), t0);
        assert!(!w.enter_pairing(Duration::from_secs(120), t0 + Duration::from_secs(100)));
        assert!(!w.update(t0 + Duration::from_secs(150)));
        assert_eq!(
            w.remaining(t0 + Duration::from_secs(150)),
            Duration::from_secs(70)
        );
        assert!(w.update(t0 + Duration::from_secs(220)));
    }

    #[test]
    fn test_advertised_name() {
        let mut w = PairingWindow::new();
        assert_eq!(w.advertised_name("Pico Bike", " [PAIRING]"), "Pico Bike");
        w.enter_pairing(Duration::from_secs(5), Instant::now());
        assert_eq!(
            w.advertised_name("Pico Bike", " [PAIRING]"),
            "Pico Bike [PAIRING]"
        );
    }

    #[test]
    fn test_connect_without_window_is_noop() {
        let mut w = PairingWindow::new();
        assert!(!w.on_connect());
    }
}
