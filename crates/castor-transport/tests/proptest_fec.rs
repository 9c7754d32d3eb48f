//! Property tests for XOR FEC: single-erasure recovery is byte-exact, a
//! complete block recovers nothing.

use bytes::Bytes;
use proptest::prelude::*;

use castor_transport::fec::{FecDecoder, FecEncoder};
use castor_transport::wire::FecPacket;

/// Deterministic variable-length source payloads.
fn make_sources(lens: &[usize], seed: u8) -> Vec<Bytes> {
    lens.iter()
        .enumerate()
        .map(|(i, &len)| {
            Bytes::from(
                (0..len)
                    .map(|j| ((i * 131 + j * 7 + seed as usize) % 256) as u8)
                    .collect::<Vec<u8>>(),
            )
        })
        .collect()
}

/// Run every source through an encoder block and return its parity.
fn encode_block(sources: &[Bytes]) -> FecPacket {
    let mut enc = FecEncoder::new(sources.len(), 1);
    let mut parity = Vec::new();
    for (i, src) in sources.iter().enumerate() {
        parity = enc.push(i as u32, src.clone());
    }
    let parity = parity.remove(0);
    FecPacket {
        seq: 0,
        timestamp_ms: 0,
        block_index: parity.block_index,
        source_seqs: parity.source_seqs,
        source_lens: parity.source_lens,
        parity: parity.parity,
    }
}

proptest! {
    /// A single erased source in a FEC block is recovered byte for byte.
    #[test]
    fn fec_single_erasure_identity(
        lens in proptest::collection::vec(1usize..1400, 2..9),
        lost_pick in any::<prop::sample::Index>(),
        seed in any::<u8>(),
    ) {
        let sources = make_sources(&lens, seed);
        let lost = lost_pick.index(sources.len());
        let parity = encode_block(&sources);

        let mut dec = FecDecoder::new();
        for (i, src) in sources.iter().enumerate() {
            if i != lost {
                dec.observe_source(i as u32, src.clone());
            }
        }
        let recovered = dec.push_parity(&parity);
        let (seq, payload) = recovered.expect("single erasure recovers");
        prop_assert_eq!(seq, lost as u32);
        prop_assert_eq!(payload, sources[lost].clone());
    }

    /// A fully received block needs and gets no recovery.
    #[test]
    fn fec_complete_block_recovers_nothing(
        lens in proptest::collection::vec(1usize..1400, 2..9),
        seed in any::<u8>(),
    ) {
        let sources = make_sources(&lens, seed);
        let parity = encode_block(&sources);

        let mut dec = FecDecoder::new();
        for (i, src) in sources.iter().enumerate() {
            dec.observe_source(i as u32, src.clone());
        }
        prop_assert!(dec.push_parity(&parity).is_none());
        prop_assert_eq!(dec.recovered_packets(), 0);
        prop_assert_eq!(dec.unrecovered_blocks(), 0);
    }
}
