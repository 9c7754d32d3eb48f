//! # Frame Fragmentation & Reassembly
//!
//! Splits one encoded frame into MTU-sized video packets with consecutive
//! sequence numbers and rebuilds frames from fragments on the receiver.
//!
//! Reassembly invariants:
//!
//! - a delivered frame is the exact concatenation the sender fragmented
//! - duplicate fragments are idempotent
//! - a fragment whose `total_fragments` disagrees with its assembly discards
//!   the whole assembly
//! - assemblies further than `reorder_window` behind the newest frame are
//!   evicted, complete or not
//! - a frame whose last fragment lands more than `max_presentation_delay`
//!   after its first is dropped as late
//!
//! Completed frames are handed out in arrival order: if frame F+1 completes
//! before F, F+1 is delivered first. The decoder conceals missing frames.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use quanta::Instant;
use tracing::{debug, trace};

use crate::wire::{flags, VideoPacket};

// ─── Fragmentation ───────────────────────────────────────────────────────────

/// Split `data` into `ceil(len / max_payload)` video packets with sequence
/// numbers starting at `first_seq`.
///
/// Every fragment of a keyframe carries the KEYFRAME flag. FRAGMENT is set on
/// all fragments of a multi-fragment frame; FRAGMENT_END is set on the last
/// fragment of every frame, including single-fragment ones.
pub fn fragment_frame(
    data: Bytes,
    frame_index: u32,
    is_keyframe: bool,
    max_payload: usize,
    first_seq: u32,
    timestamp_ms: u64,
) -> Vec<VideoPacket> {
    assert!(max_payload > 0, "max_payload must be positive");

    let total = data.len().div_ceil(max_payload).max(1);
    let mut packets = Vec::with_capacity(total);

    for i in 0..total {
        let start = i * max_payload;
        let end = ((i + 1) * max_payload).min(data.len());

        let mut fl = 0u8;
        if is_keyframe {
            fl |= flags::KEYFRAME;
        }
        if total > 1 {
            fl |= flags::FRAGMENT;
        }
        if i + 1 == total {
            fl |= flags::FRAGMENT_END;
        }

        packets.push(VideoPacket {
            seq: first_seq.wrapping_add(i as u32),
            timestamp_ms,
            flags: fl,
            frame_index,
            fragment_index: i as u16,
            total_fragments: total as u16,
            data: data.slice(start..end),
        });
    }

    packets
}

// ─── Completed Frame ─────────────────────────────────────────────────────────

/// A fully reassembled compressed frame, ready for the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedFrame {
    pub frame_index: u32,
    pub is_keyframe: bool,
    /// Sender timestamp of the frame's fragments (opaque token).
    pub timestamp_ms: u64,
    pub data: Bytes,
}

// ─── Reassembly ──────────────────────────────────────────────────────────────

#[derive(Debug)]
struct FrameAssembly {
    first_seen: Instant,
    total_fragments: u16,
    fragments: BTreeMap<u16, Bytes>,
    is_keyframe: bool,
    timestamp_ms: u64,
}

/// Reassembly drop/violation counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyStats {
    /// Frames delivered to the decoder boundary.
    pub completed_frames: u64,
    /// Redundant fragments (retransmit duplicates, FEC overlap).
    pub duplicate_fragments: u64,
    /// Assemblies evicted by the reorder window before completing.
    pub incomplete_frames: u64,
    /// Frames completed past the presentation deadline.
    pub late_frames: u64,
    /// Assemblies discarded over a `total_fragments` mismatch.
    pub inconsistent_assemblies: u64,
    /// Fragments for frames already delivered or evicted.
    pub stale_fragments: u64,
}

/// Frame reassembly table, owned by the receive task.
pub struct ReassemblyBuffer {
    assemblies: HashMap<u32, FrameAssembly>,
    /// Frames already delivered or dropped, kept within the reorder window so
    /// their straggler fragments can be recognized.
    finished: BTreeSet<u32>,
    newest_frame: Option<u32>,
    reorder_window: u32,
    max_presentation_delay: Duration,
    stats: ReassemblyStats,
}

impl ReassemblyBuffer {
    pub fn new(reorder_window: u32, max_presentation_delay: Duration) -> Self {
        ReassemblyBuffer {
            assemblies: HashMap::new(),
            finished: BTreeSet::new(),
            newest_frame: None,
            reorder_window,
            max_presentation_delay,
            stats: ReassemblyStats::default(),
        }
    }

    /// Insert one fragment. Returns the completed frame when this fragment
    /// finishes it within the presentation deadline.
    pub fn insert(&mut self, pkt: &VideoPacket, now: Instant) -> Option<CompressedFrame> {
        let frame_index = pkt.frame_index;

        let newest = self.newest_frame.map_or(frame_index, |n| n.max(frame_index));
        self.newest_frame = Some(newest);
        self.evict_stale();

        let horizon = newest.saturating_sub(self.reorder_window);
        if frame_index < horizon || self.finished.contains(&frame_index) {
            self.stats.stale_fragments += 1;
            return None;
        }
        if pkt.total_fragments == 0 || pkt.fragment_index >= pkt.total_fragments {
            self.stats.inconsistent_assemblies += 1;
            self.finished.insert(frame_index);
            self.assemblies.remove(&frame_index);
            return None;
        }

        let assembly = self.assemblies.entry(frame_index).or_insert_with(|| {
            trace!(frame = frame_index, total = pkt.total_fragments, "new assembly");
            FrameAssembly {
                first_seen: now,
                total_fragments: pkt.total_fragments,
                fragments: BTreeMap::new(),
                is_keyframe: false,
                timestamp_ms: pkt.timestamp_ms,
            }
        });

        if assembly.total_fragments != pkt.total_fragments {
            debug!(
                frame = frame_index,
                expected = assembly.total_fragments,
                got = pkt.total_fragments,
                "inconsistent fragment count, discarding assembly"
            );
            self.stats.inconsistent_assemblies += 1;
            self.assemblies.remove(&frame_index);
            self.finished.insert(frame_index);
            return None;
        }

        if assembly.fragments.contains_key(&pkt.fragment_index) {
            self.stats.duplicate_fragments += 1;
            return None;
        }

        assembly.is_keyframe |= pkt.is_keyframe();
        if assembly.timestamp_ms == 0 {
            assembly.timestamp_ms = pkt.timestamp_ms;
        }
        assembly
            .fragments
            .insert(pkt.fragment_index, pkt.data.clone());

        if assembly.fragments.len() < assembly.total_fragments as usize {
            return None;
        }

        // Complete: every index in [0, total) is present because indices are
        // bounds-checked on insert and the map is keyed by index.
        let assembly = self
            .assemblies
            .remove(&frame_index)
            .expect("assembly present");
        self.finished.insert(frame_index);

        if now.duration_since(assembly.first_seen) > self.max_presentation_delay {
            debug!(frame = frame_index, "frame completed past presentation deadline");
            self.stats.late_frames += 1;
            return None;
        }

        let total_len: usize = assembly.fragments.values().map(|f| f.len()).sum();
        let mut data = BytesMut::with_capacity(total_len);
        for fragment in assembly.fragments.values() {
            data.extend_from_slice(fragment);
        }

        self.stats.completed_frames += 1;
        Some(CompressedFrame {
            frame_index,
            is_keyframe: assembly.is_keyframe,
            timestamp_ms: assembly.timestamp_ms,
            data: data.freeze(),
        })
    }

    /// Drop assemblies more than `reorder_window` frames behind the newest
    /// seen frame, and prune the finished set to the same horizon.
    fn evict_stale(&mut self) {
        let Some(newest) = self.newest_frame else {
            return;
        };
        let horizon = newest.saturating_sub(self.reorder_window);

        let evicted: Vec<u32> = self
            .assemblies
            .keys()
            .copied()
            .filter(|&f| f < horizon)
            .collect();
        for frame in evicted {
            debug!(frame, newest, "evicting incomplete frame");
            self.assemblies.remove(&frame);
            self.stats.incomplete_frames += 1;
        }

        while let Some(&oldest) = self.finished.first() {
            if oldest < horizon {
                self.finished.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// Number of in-progress assemblies.
    pub fn pending(&self) -> usize {
        self.assemblies.len()
    }
}
