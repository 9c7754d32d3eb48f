//! # Peer Sessions
//!
//! Heartbeat-driven connection lifecycle. Every peer (each client on the
//! server, the single server on a client) walks the same state machine:
//!
//! ```text
//!   Probing ──any packet──▶ Established ──silent > ½ timeout──▶ Stale
//!      │                        ▲    │                            │
//!      └── created on first ────┘    └──── silent > timeout ──────┤
//!          inbound heartbeat                                      ▼
//!                                                              Expired
//! ```
//!
//! Entries refresh on every packet and expire after the inactivity timeout.
//! The registry has one authority (the transport's TX/ticker thread); other
//! threads hand it observations through commands.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use quanta::Instant;
use tracing::{debug, info};

use crate::wire::HeartbeatBody;

/// Peer lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Contact initiated, no reply yet.
    Probing,
    /// Bidirectional traffic observed recently.
    Established,
    /// Silent for over half the inactivity timeout; heartbeats continue.
    Stale,
}

/// Per-peer bookkeeping.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub addr: SocketAddr,
    pub state: PeerState,
    pub last_seen: Instant,
    /// The peer's latest self-reported stats.
    pub stats: HeartbeatBody,
    /// `timestamp_ms` of the peer's most recent heartbeat, echoed back in
    /// ours so the peer can measure RTT.
    pub last_heartbeat_ts: Option<u64>,
}

/// Result of a liveness sweep.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Peers that just crossed into `Stale`.
    pub newly_stale: Vec<SocketAddr>,
    /// Peers removed for inactivity.
    pub expired: Vec<PeerEntry>,
}

/// Table of live peers keyed by socket address.
pub struct PeerRegistry {
    peers: HashMap<SocketAddr, PeerEntry>,
    inactivity_timeout: Duration,
}

impl PeerRegistry {
    pub fn new(inactivity_timeout: Duration) -> Self {
        PeerRegistry {
            peers: HashMap::new(),
            inactivity_timeout,
        }
    }

    /// Register a peer we are initiating contact with (client → server).
    pub fn register_outbound(&mut self, addr: SocketAddr, now: Instant) {
        self.peers.entry(addr).or_insert_with(|| PeerEntry {
            addr,
            state: PeerState::Probing,
            last_seen: now,
            stats: HeartbeatBody::default(),
            last_heartbeat_ts: None,
        });
    }

    /// Refresh a known peer on any inbound packet. Returns false for unknown
    /// senders (which the caller counts and drops).
    pub fn observe_packet(&mut self, addr: SocketAddr, now: Instant) -> bool {
        let Some(entry) = self.peers.get_mut(&addr) else {
            return false;
        };
        entry.last_seen = now;
        if entry.state != PeerState::Established {
            info!(peer = %addr, "peer established");
            entry.state = PeerState::Established;
        }
        true
    }

    /// Create or refresh a peer from an inbound heartbeat. Returns true when
    /// the peer is new.
    pub fn observe_heartbeat(
        &mut self,
        addr: SocketAddr,
        stats: HeartbeatBody,
        heartbeat_ts: u64,
        now: Instant,
    ) -> bool {
        let created = !self.peers.contains_key(&addr);
        let entry = self.peers.entry(addr).or_insert_with(|| PeerEntry {
            addr,
            state: PeerState::Established,
            last_seen: now,
            stats: HeartbeatBody::default(),
            last_heartbeat_ts: None,
        });
        entry.last_seen = now;
        entry.state = PeerState::Established;
        entry.stats = stats;
        entry.last_heartbeat_ts = Some(heartbeat_ts);
        if created {
            info!(peer = %addr, "peer joined");
        }
        created
    }

    /// Advance lifecycle timers: mark half-silent peers stale and remove
    /// peers past the inactivity timeout.
    pub fn sweep(&mut self, now: Instant) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let stale_after = self.inactivity_timeout / 2;

        let expired_addrs: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_seen) > self.inactivity_timeout)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in expired_addrs {
            if let Some(entry) = self.peers.remove(&addr) {
                info!(peer = %addr, "peer expired");
                outcome.expired.push(entry);
            }
        }

        for (addr, entry) in self.peers.iter_mut() {
            if entry.state == PeerState::Established
                && now.duration_since(entry.last_seen) > stale_after
            {
                debug!(peer = %addr, "peer stale");
                entry.state = PeerState::Stale;
                outcome.newly_stale.push(*addr);
            }
        }

        outcome
    }

    /// Remove a peer explicitly (socket error path).
    pub fn remove(&mut self, addr: SocketAddr) -> Option<PeerEntry> {
        self.peers.remove(&addr)
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&PeerEntry> {
        self.peers.get(addr)
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.peers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn registry() -> PeerRegistry {
        PeerRegistry::new(Duration::from_secs(10))
    }

    #[test]
    fn heartbeat_creates_established_peer() {
        let mut reg = registry();
        let now = Instant::now();
        assert!(reg.observe_heartbeat(addr(1000), HeartbeatBody::default(), 42, now));
        let entry = reg.get(&addr(1000)).unwrap();
        assert_eq!(entry.state, PeerState::Established);
        assert_eq!(entry.last_heartbeat_ts, Some(42));

        // Second heartbeat refreshes, does not recreate.
        assert!(!reg.observe_heartbeat(addr(1000), HeartbeatBody::default(), 43, now));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn probing_to_established_on_reply() {
        let mut reg = registry();
        let now = Instant::now();
        reg.register_outbound(addr(2000), now);
        assert_eq!(reg.get(&addr(2000)).unwrap().state, PeerState::Probing);

        assert!(reg.observe_packet(addr(2000), now + Duration::from_millis(30)));
        assert_eq!(reg.get(&addr(2000)).unwrap().state, PeerState::Established);
    }

    #[test]
    fn unknown_sender_rejected() {
        let mut reg = registry();
        assert!(!reg.observe_packet(addr(3000), Instant::now()));
    }

    #[test]
    fn silent_peer_goes_stale_then_expires() {
        let mut reg = registry();
        let base = Instant::now();
        reg.observe_heartbeat(addr(4000), HeartbeatBody::default(), 0, base);

        // Past half the timeout: stale.
        let outcome = reg.sweep(base + Duration::from_secs(6));
        assert_eq!(outcome.newly_stale, vec![addr(4000)]);
        assert_eq!(reg.get(&addr(4000)).unwrap().state, PeerState::Stale);

        // Stale is reported once.
        let outcome = reg.sweep(base + Duration::from_secs(7));
        assert!(outcome.newly_stale.is_empty());

        // Past the full timeout: removed.
        let outcome = reg.sweep(base + Duration::from_secs(11));
        assert_eq!(outcome.expired.len(), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn traffic_revives_stale_peer() {
        let mut reg = registry();
        let base = Instant::now();
        reg.observe_heartbeat(addr(5000), HeartbeatBody::default(), 0, base);
        reg.sweep(base + Duration::from_secs(6));
        assert_eq!(reg.get(&addr(5000)).unwrap().state, PeerState::Stale);

        reg.observe_packet(addr(5000), base + Duration::from_secs(7));
        assert_eq!(reg.get(&addr(5000)).unwrap().state, PeerState::Established);

        let outcome = reg.sweep(base + Duration::from_secs(8));
        assert!(outcome.expired.is_empty());
    }

    #[test]
    fn explicit_removal() {
        let mut reg = registry();
        reg.observe_heartbeat(addr(6000), HeartbeatBody::default(), 0, Instant::now());
        assert!(reg.remove(addr(6000)).is_some());
        assert!(reg.remove(addr(6000)).is_none());
    }

    #[test]
    fn sweep_expires_unanswered_probe() {
        let mut reg = registry();
        let base = Instant::now();
        reg.register_outbound(addr(7000), base);
        let outcome = reg.sweep(base + Duration::from_secs(11));
        assert_eq!(outcome.expired.len(), 1);
    }
}
