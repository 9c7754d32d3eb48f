//! # XOR Forward Error Correction
//!
//! The sender groups outgoing video packets into disjoint blocks of `k`
//! consecutive packets and emits parity packets whose payload is the
//! byte-wise XOR of the block's payloads, each zero-padded to the block's
//! longest payload. The parity packet carries one length per source so a
//! recovered payload can be truncated to its true size; without the length
//! vector, variable-length recovery would be wrong.
//!
//! A block with exactly one missing source is recoverable by XORing the
//! parity with the surviving payloads. Two or more losses in a block are not
//! recoverable here and are left to NACK retransmission. The block framing
//! would also fit a systematic Reed-Solomon code, should XOR ever prove too
//! weak.
//!
//! Parity covers the flags byte plus the full video wire payload (fragment
//! prefix included), so a recovered payload reparses into a complete,
//! routable video packet with its KEYFRAME bit intact.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::wire::FecPacket;

/// How many protected blocks the decoder keeps before evicting the oldest.
const MAX_TRACKED_BLOCKS: usize = 64;

/// How many recent source payloads the decoder retains for recovery.
const MAX_TRACKED_SOURCES: usize = 2048;

// ─── Encoder ─────────────────────────────────────────────────────────────────

/// Parity data for one block, ready to be wrapped into a [`FecPacket`] by the
/// sender (which assigns its seq and timestamp).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FecParity {
    pub block_index: u32,
    pub source_seqs: Vec<u32>,
    pub source_lens: Vec<u32>,
    pub parity: Bytes,
}

/// Accumulates outgoing video payloads into FEC blocks.
pub struct FecEncoder {
    block_size: usize,
    parity_count: usize,
    next_block_index: u32,
    buffer: Vec<(u32, Bytes)>,
}

impl FecEncoder {
    /// `parity_count` is `max(1, ⌊block_size · overhead⌋)` for the configured
    /// overhead ratio; the caller computes it from config.
    pub fn new(block_size: usize, parity_count: usize) -> Self {
        assert!(block_size >= 2, "FEC block size must be >= 2");
        assert!(parity_count >= 1, "FEC parity count must be >= 1");
        FecEncoder {
            block_size,
            parity_count,
            next_block_index: 0,
            buffer: Vec::with_capacity(block_size),
        }
    }

    /// Feed one transmitted video packet's FEC coverage unit (flags byte +
    /// wire payload). Returns the parity packets for the block this packet
    /// completed, if any.
    pub fn push(&mut self, seq: u32, payload: Bytes) -> Vec<FecParity> {
        self.buffer.push((seq, payload));
        if self.buffer.len() < self.block_size {
            return Vec::new();
        }
        self.emit_block()
    }

    /// Emit parity for a partial block, if one is buffered.
    pub fn flush(&mut self) -> Vec<FecParity> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        self.emit_block()
    }

    /// Number of source packets buffered toward the next block.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn emit_block(&mut self) -> Vec<FecParity> {
        let block_index = self.next_block_index;
        self.next_block_index = self.next_block_index.wrapping_add(1);

        let sources = std::mem::take(&mut self.buffer);
        let source_seqs: Vec<u32> = sources.iter().map(|(s, _)| *s).collect();
        let source_lens: Vec<u32> = sources.iter().map(|(_, p)| p.len() as u32).collect();
        let parity = xor_payloads(sources.iter().map(|(_, p)| p.as_ref()));

        trace!(
            block = block_index,
            sources = source_seqs.len(),
            parity_len = parity.len(),
            "fec block sealed"
        );

        (0..self.parity_count)
            .map(|_| FecParity {
                block_index,
                source_seqs: source_seqs.clone(),
                source_lens: source_lens.clone(),
                parity: parity.clone(),
            })
            .collect()
    }
}

/// XOR payloads together, right-padding each with zeros to the longest.
fn xor_payloads<'a>(payloads: impl Iterator<Item = &'a [u8]>) -> Bytes {
    let mut acc: Vec<u8> = Vec::new();
    for payload in payloads {
        if payload.len() > acc.len() {
            acc.resize(payload.len(), 0);
        }
        for (a, &b) in acc.iter_mut().zip(payload) {
            *a ^= b;
        }
    }
    Bytes::from(acc)
}

// ─── Decoder ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct BlockState {
    source_seqs: Vec<u32>,
    source_lens: Vec<u32>,
    parity: Bytes,
    counted_unrecovered: bool,
}

/// Receiver-side FEC state: recently observed source payloads plus parity
/// blocks still waiting for recovery.
pub struct FecDecoder {
    blocks: HashMap<u32, BlockState>,
    block_order: VecDeque<u32>,
    /// seq of a protected source → the block tracking it.
    membership: HashMap<u32, u32>,
    sources: HashMap<u32, Bytes>,
    source_order: VecDeque<u32>,
    recovered_packets: u64,
    unrecovered_blocks: u64,
}

impl FecDecoder {
    pub fn new() -> Self {
        FecDecoder {
            blocks: HashMap::new(),
            block_order: VecDeque::new(),
            membership: HashMap::new(),
            sources: HashMap::new(),
            source_order: VecDeque::new(),
            recovered_packets: 0,
            unrecovered_blocks: 0,
        }
    }

    /// Record a received video packet's FEC coverage unit. If the packet fills the
    /// last hole of a tracked block, the block is dropped (nothing left to
    /// recover); recovery itself only triggers from parity, so this returns
    /// nothing.
    pub fn observe_source(&mut self, seq: u32, payload: Bytes) -> Option<(u32, Bytes)> {
        self.sources.insert(seq, payload);
        self.source_order.push_back(seq);
        while self.source_order.len() > MAX_TRACKED_SOURCES {
            if let Some(old) = self.source_order.pop_front() {
                self.sources.remove(&old);
            }
        }

        let block_index = *self.membership.get(&seq)?;
        self.try_recover(block_index)
    }

    /// Record a parity packet and attempt recovery for its block.
    pub fn push_parity(&mut self, pkt: &FecPacket) -> Option<(u32, Bytes)> {
        if pkt.source_seqs.len() != pkt.source_lens.len() || pkt.source_seqs.is_empty() {
            debug!(block = pkt.block_index, "malformed fec block header");
            return None;
        }

        if !self.blocks.contains_key(&pkt.block_index) {
            for &seq in &pkt.source_seqs {
                self.membership.insert(seq, pkt.block_index);
            }
            self.blocks.insert(
                pkt.block_index,
                BlockState {
                    source_seqs: pkt.source_seqs.clone(),
                    source_lens: pkt.source_lens.clone(),
                    parity: pkt.parity.clone(),
                    counted_unrecovered: false,
                },
            );
            self.block_order.push_back(pkt.block_index);
            self.enforce_block_limit();
        }

        self.try_recover(pkt.block_index)
    }

    /// Packets reconstructed from parity so far.
    pub fn recovered_packets(&self) -> u64 {
        self.recovered_packets
    }

    /// Blocks that had at least two losses when their parity arrived.
    pub fn unrecovered_blocks(&self) -> u64 {
        self.unrecovered_blocks
    }

    /// Attempt single-loss XOR recovery for a tracked block.
    fn try_recover(&mut self, block_index: u32) -> Option<(u32, Bytes)> {
        let block = self.blocks.get_mut(&block_index)?;

        let missing: Vec<usize> = block
            .source_seqs
            .iter()
            .enumerate()
            .filter(|(_, seq)| !self.sources.contains_key(seq))
            .map(|(i, _)| i)
            .collect();

        match missing.len() {
            0 => {
                // Fully received; the block is done.
                self.drop_block(block_index);
                None
            }
            1 => {
                let idx = missing[0];
                let block = self.blocks.get(&block_index).expect("block tracked");
                let missing_seq = block.source_seqs[idx];
                let missing_len = block.source_lens[idx] as usize;

                let mut recovered = vec![0u8; block.parity.len()];
                recovered.copy_from_slice(&block.parity);
                for (i, seq) in block.source_seqs.iter().enumerate() {
                    if i == idx {
                        continue;
                    }
                    let payload = self.sources.get(seq).expect("present source");
                    for (r, &b) in recovered.iter_mut().zip(payload.as_ref()) {
                        *r ^= b;
                    }
                }
                if missing_len > recovered.len() {
                    debug!(block = block_index, "length vector exceeds parity length");
                    self.drop_block(block_index);
                    return None;
                }
                recovered.truncate(missing_len);

                debug!(block = block_index, seq = missing_seq, "fec recovered packet");
                self.recovered_packets += 1;
                self.drop_block(block_index);
                Some((missing_seq, Bytes::from(recovered)))
            }
            n => {
                if !block.counted_unrecovered {
                    debug!(block = block_index, missing = n, "fec block beyond repair");
                    block.counted_unrecovered = true;
                    self.unrecovered_blocks += 1;
                }
                // Keep the block: a retransmit may still close all but one hole.
                None
            }
        }
    }

    fn drop_block(&mut self, block_index: u32) {
        if let Some(block) = self.blocks.remove(&block_index) {
            for seq in block.source_seqs {
                self.membership.remove(&seq);
            }
        }
        self.block_order.retain(|&b| b != block_index);
    }

    fn enforce_block_limit(&mut self) {
        while self.block_order.len() > MAX_TRACKED_BLOCKS {
            if let Some(oldest) = self.block_order.front().copied() {
                self.drop_block(oldest);
            }
        }
    }
}

impl Default for FecDecoder {
    fn default() -> Self {
        Self::new()
    }
}
