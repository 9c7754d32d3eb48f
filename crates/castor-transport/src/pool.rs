//! # Send Cache & Sequence Plumbing
//!
//! Slab-backed cache of recently transmitted datagrams for NACK-driven
//! retransmission, plus the shared sequence counter and the wire timestamp
//! clock.
//!
//! The cache stores the exact serialized datagram, so a retransmit is
//! byte-identical to the original: same seq, flags and timestamp. Eviction is
//! strictly by age; a NACK for an evicted seq is a silent miss and the
//! receiver eventually declares the packet lost.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use quanta::Instant;
use slab::Slab;

// ─── Send Cache ──────────────────────────────────────────────────────────────

/// One cached datagram.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub seq: u32,
    /// Full wire bytes (header + payload) as originally sent.
    pub datagram: Bytes,
    pub is_keyframe: bool,
    pub cached_at: Instant,
}

/// Fixed-capacity ring of the last N transmitted packets, indexed by seq.
pub struct SendCache {
    entries: Slab<CacheEntry>,
    index: HashMap<u32, usize>,
    /// Insertion order; front is oldest.
    order: VecDeque<u32>,
    capacity: usize,
}

impl SendCache {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "send cache capacity must be positive");
        SendCache {
            entries: Slab::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert a transmitted datagram, evicting the oldest entry when full.
    pub fn insert(&mut self, seq: u32, datagram: Bytes, is_keyframe: bool) {
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                if let Some(key) = self.index.remove(&oldest) {
                    self.entries.remove(key);
                }
            }
        }
        let key = self.entries.insert(CacheEntry {
            seq,
            datagram,
            is_keyframe,
            cached_at: Instant::now(),
        });
        self.index.insert(seq, key);
        self.order.push_back(seq);
    }

    /// Look up a cached datagram for retransmission.
    pub fn get(&self, seq: u32) -> Option<&CacheEntry> {
        let key = self.index.get(&seq)?;
        self.entries.get(*key)
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.index.contains_key(&seq)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ─── Sequence Generator ─────────────────────────────────────────────────────

/// Monotonic per-sender sequence counter, shared across producer threads.
/// Wraps at `u32::MAX`; sessions are not expected to live that long.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    next: AtomicU32,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        SequenceGenerator {
            next: AtomicU32::new(0),
        }
    }

    /// Claim one sequence number.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Claim `count` consecutive sequence numbers, returning the first.
    /// A fragmented frame claims its whole run at once so fragments stay
    /// consecutive even with concurrent control traffic.
    pub fn reserve(&self, count: u32) -> u32 {
        self.next.fetch_add(count, Ordering::Relaxed)
    }

    /// The next sequence number that will be handed out.
    pub fn peek(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }
}

// ─── Timestamp Clock ────────────────────────────────────────────────────────

/// Millisecond wall clock for packet timestamps, anchored to a sender-local
/// monotonic origin. Receivers treat the values as opaque echo tokens.
#[derive(Debug)]
pub struct TimestampClock {
    epoch: Instant,
}

impl TimestampClock {
    pub fn new() -> Self {
        TimestampClock {
            epoch: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for TimestampClock {
    fn default() -> Self {
        Self::new()
    }
}
