//! # Gap Tracking & NACK Batching
//!
//! Receiver-side loss detection. Sequence gaps go into a `missing` set; a
//! rate-limited ticker drains the oldest gaps into NACK batches. A seq that
//! was asked for moves to a pending set and is re-queued if it does not
//! arrive within the retransmit timeout. The sender-side half of
//! retransmission lives in [`crate::pool::SendCache`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use quanta::Instant;
use tracing::{debug, trace};

use crate::wire::MAX_NACK_SEQS;

/// A jump beyond this many seqs is treated as a sender reset, not a burst
/// loss worth NACKing.
const MAX_GAP: u32 = 10_000;

/// How many NACKs a seq may appear in before it is written off as lost.
/// Bounds retransmit traffic for packets the sender no longer has.
const MAX_NACK_RETRIES: u8 = 3;

/// Tracks the received sequence space of one sender.
pub struct GapTracker {
    initialized: bool,
    first_seen: u32,
    highest_seen: u32,
    received_count: u64,
    /// Gaps not yet asked for.
    missing: BTreeSet<u32>,
    /// Gaps asked for in a NACK, awaiting arrival. seq → when asked.
    pending: BTreeMap<u32, Instant>,
    /// Times each seq has been NACKed.
    retries: HashMap<u32, u8>,
    /// Seqs abandoned after exhausting the retry budget.
    abandoned: u64,
    last_nack_at: Option<Instant>,
    nack_interval: Duration,
    retransmit_timeout: Duration,
}

impl GapTracker {
    pub fn new(nack_interval: Duration, retransmit_timeout: Duration) -> Self {
        GapTracker {
            initialized: false,
            first_seen: 0,
            highest_seen: 0,
            received_count: 0,
            missing: BTreeSet::new(),
            pending: BTreeMap::new(),
            retries: HashMap::new(),
            abandoned: 0,
            last_nack_at: None,
            nack_interval,
            retransmit_timeout,
        }
    }

    /// Record an observed seq. Returns false for duplicates.
    pub fn record_received(&mut self, seq: u32) -> bool {
        if !self.initialized {
            self.initialized = true;
            self.first_seen = seq;
            self.highest_seen = seq;
            self.received_count = 1;
            return true;
        }

        if seq > self.highest_seen {
            let gap = seq - self.highest_seen;
            if gap > MAX_GAP {
                debug!(from = self.highest_seen, to = seq, "sequence jump, resetting tracker");
                self.missing.clear();
                self.pending.clear();
                self.retries.clear();
                self.first_seen = seq;
                self.received_count = 0;
            } else {
                for missing in (self.highest_seen + 1)..seq {
                    self.missing.insert(missing);
                }
            }
            self.highest_seen = seq;
            self.received_count += 1;
            return true;
        }

        // At or below the high-water mark: new only if it fills a hole.
        if self.missing.remove(&seq) || self.pending.remove(&seq).is_some() {
            trace!(seq, "gap filled");
            self.retries.remove(&seq);
            self.received_count += 1;
            return true;
        }
        false
    }

    /// Collect the next NACK batch: up to [`MAX_NACK_SEQS`] oldest missing
    /// seqs, at most once per `nack_interval`. Pending seqs whose retransmit
    /// timed out are re-queued first.
    pub fn take_nack_batch(&mut self, now: Instant) -> Option<Vec<u32>> {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, &asked)| now.duration_since(asked) >= self.retransmit_timeout)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in expired {
            self.pending.remove(&seq);
            if self.retries.get(&seq).copied().unwrap_or(0) >= MAX_NACK_RETRIES {
                debug!(seq, "retry budget exhausted, declaring lost");
                self.retries.remove(&seq);
                self.abandoned += 1;
            } else {
                self.missing.insert(seq);
            }
        }

        if self.missing.is_empty() {
            return None;
        }
        if let Some(last) = self.last_nack_at {
            if now.duration_since(last) < self.nack_interval {
                return None;
            }
        }

        let batch: Vec<u32> = self.missing.iter().copied().take(MAX_NACK_SEQS).collect();
        for &seq in &batch {
            self.missing.remove(&seq);
            self.pending.insert(seq, now);
            *self.retries.entry(seq).or_insert(0) += 1;
        }
        self.last_nack_at = Some(now);
        Some(batch)
    }

    /// Gaps currently outstanding (unasked plus awaiting retransmit).
    pub fn missing_count(&self) -> usize {
        self.missing.len() + self.pending.len()
    }

    /// Lifetime loss estimate: share of the seen sequence span that never
    /// arrived.
    pub fn loss_ratio(&self) -> f64 {
        if !self.initialized {
            return 0.0;
        }
        let expected = (self.highest_seen - self.first_seen) as u64 + 1;
        if expected == 0 {
            return 0.0;
        }
        let received = self.received_count.min(expected);
        1.0 - received as f64 / expected as f64
    }

    /// Seqs written off after the NACK retry budget ran out.
    pub fn abandoned(&self) -> u64 {
        self.abandoned
    }

    pub fn highest_seen(&self) -> u32 {
        self.highest_seen
    }
}
