//! # Castor Wire Format
//!
//! Fixed-header UDP datagram codec.
//!
//! ## Common header (18 bytes, big-endian)
//!
//! ```text
//! offset  size  field
//! 0       1     packet_kind  (0=Video, 1=Audio reserved, 2=Control, 3=FEC, 4=Heartbeat)
//! 1       4     seq_num      (u32, per-sender monotonic)
//! 5       8     timestamp_ms (u64, sender-local monotonic origin)
//! 13      1     flags        (u8)
//! 14      4     payload_len  (u32)
//! ```
//!
//! Video payloads carry an 8-byte fragment prefix, FEC payloads a block
//! header with per-source sequence and length vectors, and control/heartbeat
//! payloads UTF-8 JSON with a closed tagged schema.
//!
//! Receivers treat `timestamp_ms` as an opaque token: it is echoed back in
//! heartbeats so the original sender can compute RTT against its own clock.
//! No wall-clock synchronization is assumed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use castor_common::EncoderParams;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Size of the fixed packet header.
pub const HEADER_SIZE: usize = 18;

/// Size of the video fragment prefix inside a video payload.
pub const VIDEO_HEADER_SIZE: usize = 8;

/// Size of the fixed part of a FEC payload header.
pub const FEC_HEADER_SIZE: usize = 6;

/// Maximum number of sequence numbers one NACK may carry.
pub const MAX_NACK_SEQS: usize = 100;

/// Video packet flag bits.
pub mod flags {
    pub const KEYFRAME: u8 = 0x01;
    pub const ROI: u8 = 0x02;
    pub const FRAGMENT: u8 = 0x04;
    pub const FRAGMENT_END: u8 = 0x08;
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Datagram parse failures. Every failure drops the datagram and is counted;
/// nothing is decoded lossily.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("datagram shorter than its declared length")]
    Truncated,
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("control/heartbeat body is not valid UTF-8")]
    BadUtf8,
    #[error("control/heartbeat body is not valid JSON: {0}")]
    BadJson(String),
}

// ─── Packet Kind ─────────────────────────────────────────────────────────────

/// Wire-level packet discriminator. Kind 1 is reserved for audio and is
/// rejected until an audio path exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Video = 0,
    Control = 2,
    Fec = 3,
    Heartbeat = 4,
}

impl PacketKind {
    pub fn from_byte(b: u8) -> Result<Self, ParseError> {
        match b {
            0 => Ok(PacketKind::Video),
            2 => Ok(PacketKind::Control),
            3 => Ok(PacketKind::Fec),
            4 => Ok(PacketKind::Heartbeat),
            other => Err(ParseError::UnknownKind(other)),
        }
    }
}

// ─── Decode Mode ─────────────────────────────────────────────────────────────

/// JSON body handling for control and heartbeat payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeMode {
    /// Unknown JSON fields are rejected.
    Strict,
    /// Unknown JSON fields are ignored.
    #[default]
    Lenient,
}

// ─── Control Bodies ──────────────────────────────────────────────────────────

/// Peer-reported link statistics, shared by STATS control packets and
/// heartbeats.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LinkStats {
    /// Round-trip time in milliseconds.
    #[serde(default)]
    pub rtt: f64,
    /// Loss ratio in [0, 1].
    #[serde(default)]
    pub packet_loss: f64,
    /// Receive bandwidth in bits/sec.
    #[serde(default)]
    pub bandwidth: f64,
    /// Composite congestion score in [0, 1].
    #[serde(default)]
    pub congestion: f64,
    /// Pending packets in the reporter's transmit queue.
    #[serde(default)]
    pub queue_depth: u32,
}

/// Typed control packet body. Serialized as an internally tagged JSON object,
/// e.g. `{"kind":"nack","missing_seqs":[7,8,9]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlBody {
    Ack,
    Nack { missing_seqs: Vec<u32> },
    Stats(LinkStats),
    Config { params: EncoderParams },
}

/// Heartbeat body: the sender's view of the link plus receive-side counters.
///
/// `echo_timestamp_ms` returns the `timestamp_ms` of the most recently seen
/// heartbeat from the peer; the peer subtracts it from its own clock to
/// produce an RTT sample.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HeartbeatBody {
    #[serde(default)]
    pub rtt: f64,
    #[serde(default)]
    pub packet_loss: f64,
    #[serde(default)]
    pub bandwidth: f64,
    #[serde(default)]
    pub queue_depth: u32,
    #[serde(default)]
    pub received_frames: u64,
    #[serde(default)]
    pub missing_packets: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo_timestamp_ms: Option<u64>,
}

const HEARTBEAT_FIELDS: &[&str] = &[
    "rtt",
    "packet_loss",
    "bandwidth",
    "queue_depth",
    "received_frames",
    "missing_packets",
    "echo_timestamp_ms",
];

const STATS_FIELDS: &[&str] = &["rtt", "packet_loss", "bandwidth", "congestion", "queue_depth"];

/// Reject JSON object keys outside `allowed` (plus the tag key for control
/// bodies). serde cannot combine `deny_unknown_fields` with internal tagging,
/// so strict mode checks the raw value.
fn check_known_fields(
    value: &serde_json::Value,
    allowed: &[&str],
    tag: Option<&str>,
) -> Result<(), ParseError> {
    let map = value
        .as_object()
        .ok_or_else(|| ParseError::BadJson("body is not a JSON object".into()))?;
    for key in map.keys() {
        if Some(key.as_str()) == tag {
            continue;
        }
        if !allowed.contains(&key.as_str()) {
            return Err(ParseError::BadJson(format!("unknown field `{key}`")));
        }
    }
    Ok(())
}

impl ControlBody {
    fn allowed_fields(kind: &str) -> &'static [&'static str] {
        match kind {
            "nack" => &["missing_seqs"],
            "stats" => STATS_FIELDS,
            "config" => &["params"],
            _ => &[],
        }
    }

    fn from_json(payload: &[u8], mode: DecodeMode) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(payload).map_err(|_| ParseError::BadUtf8)?;
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ParseError::BadJson(e.to_string()))?;
        if mode == DecodeMode::Strict {
            let kind = value
                .get("kind")
                .and_then(|k| k.as_str())
                .ok_or_else(|| ParseError::BadJson("missing `kind` tag".into()))?;
            check_known_fields(&value, Self::allowed_fields(kind), Some("kind"))?;
        }
        serde_json::from_value(value).map_err(|e| ParseError::BadJson(e.to_string()))
    }
}

impl HeartbeatBody {
    fn from_json(payload: &[u8], mode: DecodeMode) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(payload).map_err(|_| ParseError::BadUtf8)?;
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ParseError::BadJson(e.to_string()))?;
        if mode == DecodeMode::Strict {
            check_known_fields(&value, HEARTBEAT_FIELDS, None)?;
        }
        serde_json::from_value(value).map_err(|e| ParseError::BadJson(e.to_string()))
    }
}

// ─── Packet Variants ─────────────────────────────────────────────────────────

/// One fragment of an encoded video frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoPacket {
    pub seq: u32,
    pub timestamp_ms: u64,
    pub flags: u8,
    pub frame_index: u32,
    pub fragment_index: u16,
    pub total_fragments: u16,
    pub data: Bytes,
}

impl VideoPacket {
    pub fn is_keyframe(&self) -> bool {
        self.flags & flags::KEYFRAME != 0
    }

    pub fn is_fragmented(&self) -> bool {
        self.flags & flags::FRAGMENT != 0
    }

    pub fn is_last_fragment(&self) -> bool {
        self.flags & flags::FRAGMENT_END != 0
    }

    /// The unit FEC parity is computed over: the flags byte, then the full
    /// wire payload (fragment prefix + bitstream bytes). Covering the flags
    /// means a recovered packet keeps its KEYFRAME bit, which a
    /// single-fragment keyframe has no other fragment to re-derive from.
    pub fn fec_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + VIDEO_HEADER_SIZE + self.data.len());
        buf.put_u8(self.flags);
        buf.put_u32(self.frame_index);
        buf.put_u16(self.fragment_index);
        buf.put_u16(self.total_fragments);
        buf.extend_from_slice(&self.data);
        buf.freeze()
    }

    /// Rebuild a video packet from a FEC-recovered [`fec_payload`] unit.
    ///
    /// [`fec_payload`]: VideoPacket::fec_payload
    pub fn from_recovered(seq: u32, payload: &[u8]) -> Result<Self, ParseError> {
        if payload.len() < 1 + VIDEO_HEADER_SIZE {
            return Err(ParseError::Truncated);
        }
        let mut buf = payload;
        let fl = buf.get_u8();
        let frame_index = buf.get_u32();
        let fragment_index = buf.get_u16();
        let total_fragments = buf.get_u16();
        let data = Bytes::copy_from_slice(buf);
        Ok(VideoPacket {
            seq,
            timestamp_ms: 0,
            flags: fl,
            frame_index,
            fragment_index,
            total_fragments,
            data,
        })
    }
}

/// A parity packet covering one FEC block of video packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FecPacket {
    pub seq: u32,
    pub timestamp_ms: u64,
    pub block_index: u32,
    /// Sequence numbers of the protected source packets, in block order.
    pub source_seqs: Vec<u32>,
    /// Payload length of each source packet, aligned with `source_seqs`.
    /// Required to truncate a recovered payload to its true length.
    pub source_lens: Vec<u32>,
    /// Byte-wise XOR of the zero-padded source payloads.
    pub parity: Bytes,
}

/// A control packet with its typed body.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPacket {
    pub seq: u32,
    pub timestamp_ms: u64,
    pub body: ControlBody,
}

/// A liveness/stats heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatPacket {
    pub seq: u32,
    pub timestamp_ms: u64,
    pub stats: HeartbeatBody,
}

/// Any Castor datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Video(VideoPacket),
    Control(ControlPacket),
    Fec(FecPacket),
    Heartbeat(HeartbeatPacket),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Video(_) => PacketKind::Video,
            Packet::Control(_) => PacketKind::Control,
            Packet::Fec(_) => PacketKind::Fec,
            Packet::Heartbeat(_) => PacketKind::Heartbeat,
        }
    }

    pub fn seq(&self) -> u32 {
        match self {
            Packet::Video(p) => p.seq,
            Packet::Control(p) => p.seq,
            Packet::Fec(p) => p.seq,
            Packet::Heartbeat(p) => p.seq,
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        match self {
            Packet::Video(p) => p.timestamp_ms,
            Packet::Control(p) => p.timestamp_ms,
            Packet::Fec(p) => p.timestamp_ms,
            Packet::Heartbeat(p) => p.timestamp_ms,
        }
    }

    /// Serialize to wire bytes (header + payload).
    pub fn encode(&self) -> BytesMut {
        match self {
            Packet::Video(p) => {
                let payload_len = VIDEO_HEADER_SIZE + p.data.len();
                let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload_len);
                put_header(
                    &mut buf,
                    PacketKind::Video,
                    p.seq,
                    p.timestamp_ms,
                    p.flags,
                    payload_len as u32,
                );
                buf.put_u32(p.frame_index);
                buf.put_u16(p.fragment_index);
                buf.put_u16(p.total_fragments);
                buf.extend_from_slice(&p.data);
                buf
            }
            Packet::Control(p) => {
                let body = serde_json::to_vec(&p.body).expect("control body serializes");
                let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
                put_header(
                    &mut buf,
                    PacketKind::Control,
                    p.seq,
                    p.timestamp_ms,
                    0,
                    body.len() as u32,
                );
                buf.extend_from_slice(&body);
                buf
            }
            Packet::Fec(p) => {
                let payload_len = FEC_HEADER_SIZE + p.source_seqs.len() * 8 + p.parity.len();
                let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload_len);
                put_header(
                    &mut buf,
                    PacketKind::Fec,
                    p.seq,
                    p.timestamp_ms,
                    0,
                    payload_len as u32,
                );
                buf.put_u32(p.block_index);
                buf.put_u16(p.source_seqs.len() as u16);
                for &seq in &p.source_seqs {
                    buf.put_u32(seq);
                }
                for &len in &p.source_lens {
                    buf.put_u32(len);
                }
                buf.extend_from_slice(&p.parity);
                buf
            }
            Packet::Heartbeat(p) => {
                let body = serde_json::to_vec(&p.stats).expect("heartbeat body serializes");
                let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
                put_header(
                    &mut buf,
                    PacketKind::Heartbeat,
                    p.seq,
                    p.timestamp_ms,
                    0,
                    body.len() as u32,
                );
                buf.extend_from_slice(&body);
                buf
            }
        }
    }

    /// Parse one datagram. Trailing bytes beyond the declared payload length
    /// are ignored (UDP delivers whole datagrams; a reader never spans two).
    pub fn decode(data: &[u8], mode: DecodeMode) -> Result<Packet, ParseError> {
        if data.len() < HEADER_SIZE {
            return Err(ParseError::Truncated);
        }
        let mut buf = data;
        let kind = PacketKind::from_byte(buf.get_u8())?;
        let seq = buf.get_u32();
        let timestamp_ms = buf.get_u64();
        let fl = buf.get_u8();
        let payload_len = buf.get_u32() as usize;
        if buf.remaining() < payload_len {
            return Err(ParseError::Truncated);
        }
        let payload = &buf[..payload_len];

        match kind {
            PacketKind::Video => {
                if payload.len() < VIDEO_HEADER_SIZE {
                    return Err(ParseError::Truncated);
                }
                let mut p = payload;
                let frame_index = p.get_u32();
                let fragment_index = p.get_u16();
                let total_fragments = p.get_u16();
                Ok(Packet::Video(VideoPacket {
                    seq,
                    timestamp_ms,
                    flags: fl,
                    frame_index,
                    fragment_index,
                    total_fragments,
                    data: Bytes::copy_from_slice(p),
                }))
            }
            PacketKind::Fec => {
                if payload.len() < FEC_HEADER_SIZE {
                    return Err(ParseError::Truncated);
                }
                let mut p = payload;
                let block_index = p.get_u32();
                let num_sources = p.get_u16() as usize;
                if p.remaining() < num_sources * 8 {
                    return Err(ParseError::Truncated);
                }
                let mut source_seqs = Vec::with_capacity(num_sources);
                for _ in 0..num_sources {
                    source_seqs.push(p.get_u32());
                }
                let mut source_lens = Vec::with_capacity(num_sources);
                for _ in 0..num_sources {
                    source_lens.push(p.get_u32());
                }
                Ok(Packet::Fec(FecPacket {
                    seq,
                    timestamp_ms,
                    block_index,
                    source_seqs,
                    source_lens,
                    parity: Bytes::copy_from_slice(p),
                }))
            }
            PacketKind::Control => {
                let body = ControlBody::from_json(payload, mode)?;
                Ok(Packet::Control(ControlPacket {
                    seq,
                    timestamp_ms,
                    body,
                }))
            }
            PacketKind::Heartbeat => {
                let stats = HeartbeatBody::from_json(payload, mode)?;
                Ok(Packet::Heartbeat(HeartbeatPacket {
                    seq,
                    timestamp_ms,
                    stats,
                }))
            }
        }
    }
}

fn put_header(
    buf: &mut BytesMut,
    kind: PacketKind,
    seq: u32,
    timestamp_ms: u64,
    fl: u8,
    payload_len: u32,
) {
    buf.put_u8(kind as u8);
    buf.put_u32(seq);
    buf.put_u64(timestamp_ms);
    buf.put_u8(fl);
    buf.put_u32(payload_len);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_packet() -> VideoPacket {
        VideoPacket {
            seq: 42,
            timestamp_ms: 1_234_567,
            flags: flags::KEYFRAME | flags::FRAGMENT,
            frame_index: 7,
            fragment_index: 1,
            total_fragments: 3,
            data: Bytes::from_static(b"bitstream bytes"),
        }
    }

    #[test]
    fn header_layout_is_18_bytes_big_endian() {
        let pkt = Packet::Video(video_packet());
        let wire = pkt.encode();
        assert_eq!(wire[0], 0); // kind
        assert_eq!(&wire[1..5], &42u32.to_be_bytes());
        assert_eq!(&wire[5..13], &1_234_567u64.to_be_bytes());
        assert_eq!(wire[13], flags::KEYFRAME | flags::FRAGMENT);
        let payload_len = u32::from_be_bytes(wire[14..18].try_into().unwrap()) as usize;
        assert_eq!(payload_len, VIDEO_HEADER_SIZE + b"bitstream bytes".len());
        assert_eq!(wire.len(), HEADER_SIZE + payload_len);
    }

    #[test]
    fn video_roundtrip() {
        let pkt = Packet::Video(video_packet());
        let wire = pkt.encode();
        let decoded = Packet::decode(&wire, DecodeMode::Lenient).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn control_nack_roundtrip() {
        let pkt = Packet::Control(ControlPacket {
            seq: 9,
            timestamp_ms: 55,
            body: ControlBody::Nack {
                missing_seqs: vec![3, 4, 10],
            },
        });
        let wire = pkt.encode();
        let decoded = Packet::decode(&wire, DecodeMode::Strict).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn control_stats_roundtrip() {
        let pkt = Packet::Control(ControlPacket {
            seq: 1,
            timestamp_ms: 2,
            body: ControlBody::Stats(LinkStats {
                rtt: 80.0,
                packet_loss: 0.03,
                bandwidth: 4_000_000.0,
                congestion: 0.2,
                queue_depth: 12,
            }),
        });
        let decoded = Packet::decode(&pkt.encode(), DecodeMode::Strict).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn control_config_roundtrip() {
        let pkt = Packet::Control(ControlPacket {
            seq: 5,
            timestamp_ms: 6,
            body: ControlBody::Config {
                params: EncoderParams {
                    width: 960,
                    height: 540,
                    fps: 30,
                    bitrate: 2_500_000,
                    gop: 30,
                    base_qp: 26,
                },
            },
        });
        let decoded = Packet::decode(&pkt.encode(), DecodeMode::Strict).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn fec_roundtrip() {
        let pkt = Packet::Fec(FecPacket {
            seq: 100,
            timestamp_ms: 777,
            block_index: 12,
            source_seqs: vec![92, 93, 94, 95],
            source_lens: vec![1400, 1400, 1400, 512],
            parity: Bytes::from(vec![0xAB; 1400]),
        });
        let wire = pkt.encode();
        let decoded = Packet::decode(&wire, DecodeMode::Lenient).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn heartbeat_roundtrip_with_echo() {
        let pkt = Packet::Heartbeat(HeartbeatPacket {
            seq: 3,
            timestamp_ms: 9000,
            stats: HeartbeatBody {
                rtt: 45.0,
                packet_loss: 0.01,
                bandwidth: 5_000_000.0,
                queue_depth: 2,
                received_frames: 120,
                missing_packets: 4,
                echo_timestamp_ms: Some(8950),
            },
        });
        let decoded = Packet::decode(&pkt.encode(), DecodeMode::Strict).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn empty_heartbeat_body_parses() {
        // The first connect heartbeat carries no stats yet.
        let pkt = Packet::Heartbeat(HeartbeatPacket {
            seq: 0,
            timestamp_ms: 1,
            stats: HeartbeatBody::default(),
        });
        let decoded = Packet::decode(&pkt.encode(), DecodeMode::Strict).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn truncated_header_rejected() {
        let err = Packet::decode(&[0u8; 10], DecodeMode::Lenient).unwrap_err();
        assert_eq!(err, ParseError::Truncated);
    }

    #[test]
    fn truncated_payload_rejected() {
        let pkt = Packet::Video(video_packet());
        let wire = pkt.encode();
        let err = Packet::decode(&wire[..wire.len() - 4], DecodeMode::Lenient).unwrap_err();
        assert_eq!(err, ParseError::Truncated);
    }

    #[test]
    fn unknown_kind_rejected() {
        let pkt = Packet::Video(video_packet());
        let mut wire = pkt.encode().to_vec();
        wire[0] = 9;
        let err = Packet::decode(&wire, DecodeMode::Lenient).unwrap_err();
        assert_eq!(err, ParseError::UnknownKind(9));
    }

    #[test]
    fn audio_kind_is_reserved() {
        let pkt = Packet::Video(video_packet());
        let mut wire = pkt.encode().to_vec();
        wire[0] = 1;
        let err = Packet::decode(&wire, DecodeMode::Lenient).unwrap_err();
        assert_eq!(err, ParseError::UnknownKind(1));
    }

    #[test]
    fn bad_utf8_body_rejected() {
        let mut buf = BytesMut::new();
        put_header(&mut buf, PacketKind::Control, 1, 2, 0, 3);
        buf.extend_from_slice(&[0xFF, 0xFE, 0xFD]);
        let err = Packet::decode(&buf, DecodeMode::Lenient).unwrap_err();
        assert_eq!(err, ParseError::BadUtf8);
    }

    #[test]
    fn bad_json_body_rejected() {
        let body = b"{not json";
        let mut buf = BytesMut::new();
        put_header(&mut buf, PacketKind::Heartbeat, 1, 2, 0, body.len() as u32);
        buf.extend_from_slice(body);
        let err = Packet::decode(&buf, DecodeMode::Lenient).unwrap_err();
        assert!(matches!(err, ParseError::BadJson(_)));
    }

    #[test]
    fn strict_mode_rejects_unknown_fields() {
        let body = br#"{"kind":"nack","missing_seqs":[1],"extra":true}"#;
        let mut buf = BytesMut::new();
        put_header(&mut buf, PacketKind::Control, 1, 2, 0, body.len() as u32);
        buf.extend_from_slice(body);

        let err = Packet::decode(&buf, DecodeMode::Strict).unwrap_err();
        assert!(matches!(err, ParseError::BadJson(_)));

        // Lenient mode tolerates the same datagram.
        let ok = Packet::decode(&buf, DecodeMode::Lenient).unwrap();
        match ok {
            Packet::Control(c) => assert_eq!(
                c.body,
                ControlBody::Nack {
                    missing_seqs: vec![1]
                }
            ),
            other => panic!("expected control packet, got {other:?}"),
        }
    }

    #[test]
    fn strict_mode_rejects_unknown_heartbeat_fields() {
        let body = br#"{"rtt":1.0,"surprise":42}"#;
        let mut buf = BytesMut::new();
        put_header(&mut buf, PacketKind::Heartbeat, 1, 2, 0, body.len() as u32);
        buf.extend_from_slice(body);
        assert!(Packet::decode(&buf, DecodeMode::Strict).is_err());
        assert!(Packet::decode(&buf, DecodeMode::Lenient).is_ok());
    }

    #[test]
    fn recovered_video_payload_reparses() {
        let original = video_packet();
        let payload = original.fec_payload();
        let recovered = VideoPacket::from_recovered(original.seq, &payload).unwrap();
        assert_eq!(recovered.frame_index, original.frame_index);
        assert_eq!(recovered.fragment_index, original.fragment_index);
        assert_eq!(recovered.total_fragments, original.total_fragments);
        assert_eq!(recovered.data, original.data);
        assert_eq!(recovered.flags, original.flags);
        assert!(recovered.is_fragmented());
        assert!(recovered.is_keyframe(), "keyframe bit survives recovery");
    }

    #[test]
    fn recovered_single_fragment_keyframe_keeps_its_flag() {
        // A single-fragment keyframe has no sibling fragment to re-derive
        // the bit from; it must come out of the parity-covered flags byte.
        let original = VideoPacket {
            seq: 8,
            timestamp_ms: 500,
            flags: flags::KEYFRAME | flags::FRAGMENT_END,
            frame_index: 4,
            fragment_index: 0,
            total_fragments: 1,
            data: Bytes::from_static(b"tiny keyframe"),
        };
        let recovered = VideoPacket::from_recovered(original.seq, &original.fec_payload()).unwrap();
        assert!(recovered.is_keyframe());
        assert!(recovered.is_last_fragment());
        assert!(!recovered.is_fragmented());
        assert_eq!(recovered.data, original.data);
    }

    #[test]
    fn trailing_bytes_beyond_declared_length_ignored() {
        let pkt = Packet::Control(ControlPacket {
            seq: 2,
            timestamp_ms: 3,
            body: ControlBody::Ack,
        });
        let mut wire = pkt.encode().to_vec();
        wire.extend_from_slice(b"junk");
        let decoded = Packet::decode(&wire, DecodeMode::Lenient).unwrap();
        assert_eq!(decoded, pkt);
    }
}
