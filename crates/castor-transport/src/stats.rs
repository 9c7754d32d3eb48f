//! # Transport Statistics
//!
//! Counter blocks shared between the transport worker threads and stats
//! consumers, plus the EWMA smoother used by the network monitor. Counters
//! are atomics so the hot paths never take a lock; `snapshot()` produces a
//! serializable copy for logging or heartbeat bodies.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// ─── Sender Stats ───────────────────────────────────────────────────────────

/// Server-side transport counters.
#[derive(Debug, Default)]
pub struct SenderStats {
    /// Datagrams handed to the socket (retransmissions included).
    pub packets_sent: AtomicU64,
    /// Wire bytes handed to the socket.
    pub bytes_sent: AtomicU64,
    /// Encoded frames accepted for transmission.
    pub frames_sent: AtomicU64,
    /// Packets re-sent in response to NACKs.
    pub retransmissions: AtomicU64,
    /// NACKed seqs that had already left the send cache.
    pub retransmit_misses: AtomicU64,
    /// FEC parity packets emitted.
    pub fec_parity_sent: AtomicU64,
    /// New packets dropped because the send queue was full.
    pub queue_dropped_new: AtomicU64,
    /// Queued packets displaced in favor of keyframe fragments.
    pub queue_dropped_old: AtomicU64,
    /// Inbound datagrams that failed to parse.
    pub malformed_packets: AtomicU64,
    /// NACK control packets processed.
    pub nacks_received: AtomicU64,
    /// Heartbeats emitted.
    pub heartbeats_sent: AtomicU64,
    /// Peers dropped for inactivity or socket errors.
    pub peers_evicted: AtomicU64,
    /// Peer events dropped on a full RX→TX channel.
    pub events_dropped: AtomicU64,
}

/// Plain copy of [`SenderStats`] for serialization.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStatsSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub frames_sent: u64,
    pub retransmissions: u64,
    pub retransmit_misses: u64,
    pub fec_parity_sent: u64,
    pub queue_dropped_new: u64,
    pub queue_dropped_old: u64,
    pub malformed_packets: u64,
    pub nacks_received: u64,
    pub heartbeats_sent: u64,
    pub peers_evicted: u64,
    pub events_dropped: u64,
}

impl SenderStats {
    pub fn snapshot(&self) -> SenderStatsSnapshot {
        SenderStatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            retransmit_misses: self.retransmit_misses.load(Ordering::Relaxed),
            fec_parity_sent: self.fec_parity_sent.load(Ordering::Relaxed),
            queue_dropped_new: self.queue_dropped_new.load(Ordering::Relaxed),
            queue_dropped_old: self.queue_dropped_old.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            nacks_received: self.nacks_received.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            peers_evicted: self.peers_evicted.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }
}

// ─── Receiver Stats ─────────────────────────────────────────────────────────

/// Client-side transport counters.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    /// Datagrams read off the socket.
    pub packets_received: AtomicU64,
    /// Wire bytes read off the socket.
    pub bytes_received: AtomicU64,
    /// Datagrams that failed to parse.
    pub malformed_packets: AtomicU64,
    /// Datagrams from an address other than the session's server.
    pub foreign_datagrams: AtomicU64,
    /// Frames delivered through `next_frame`.
    pub frames_delivered: AtomicU64,
    /// Completed frames displaced from a full frame queue.
    pub frames_dropped_queue: AtomicU64,
    /// Frames evicted incomplete by the reorder window.
    pub incomplete_frames: AtomicU64,
    /// Frames completed past the presentation deadline.
    pub late_frames: AtomicU64,
    /// Packets reconstructed by FEC.
    pub fec_recovered: AtomicU64,
    /// FEC blocks with more losses than parity could repair.
    pub unrecovered_blocks: AtomicU64,
    /// NACK packets emitted.
    pub nacks_sent: AtomicU64,
    /// Heartbeats emitted.
    pub heartbeats_sent: AtomicU64,
}

/// Plain copy of [`ReceiverStats`] for serialization.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStatsSnapshot {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub malformed_packets: u64,
    pub foreign_datagrams: u64,
    pub frames_delivered: u64,
    pub frames_dropped_queue: u64,
    pub incomplete_frames: u64,
    pub late_frames: u64,
    pub fec_recovered: u64,
    pub unrecovered_blocks: u64,
    pub nacks_sent: u64,
    pub heartbeats_sent: u64,
}

impl ReceiverStats {
    pub fn snapshot(&self) -> ReceiverStatsSnapshot {
        ReceiverStatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            foreign_datagrams: self.foreign_datagrams.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_dropped_queue: self.frames_dropped_queue.load(Ordering::Relaxed),
            incomplete_frames: self.incomplete_frames.load(Ordering::Relaxed),
            late_frames: self.late_frames.load(Ordering::Relaxed),
            fec_recovered: self.fec_recovered.load(Ordering::Relaxed),
            unrecovered_blocks: self.unrecovered_blocks.load(Ordering::Relaxed),
            nacks_sent: self.nacks_sent.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
        }
    }
}

/// Relaxed add for counter fields.
pub(crate) fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

// ─── EWMA ───────────────────────────────────────────────────────────────────

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    /// Smoothing factor in [0, 1]; higher reacts faster.
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        assert!((0.0..=1.0).contains(&alpha), "alpha must be in [0, 1]");
        Ewma {
            alpha,
            value: 0.0,
            initialized: false,
        }
    }

    /// Update with a new sample and return the smoothed value.
    pub fn update(&mut self, sample: f64) -> f64 {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
        } else {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}
