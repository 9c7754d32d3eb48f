//! End-to-end loopback tests: real sockets, real worker threads.
//!
//! The "scripted server" tests drive a [`TransportReceiver`] from a bare UDP
//! socket so loss, reordering and FEC scenarios are byte-exact and
//! deterministic.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use bytes::Bytes;

use castor_common::CastorConfig;
use castor_transport::fec::FecEncoder;
use castor_transport::fragment::fragment_frame;
use castor_transport::receiver::{ReceiverConfig, TransportReceiver};
use castor_transport::sender::{SenderConfig, TransportSender};
use castor_transport::wire::{
    ControlBody, DecodeMode, FecPacket, HeartbeatBody, HeartbeatPacket, Packet,
};

fn ephemeral_sender(cfg: &CastorConfig) -> TransportSender {
    let config = SenderConfig {
        port: 0,
        ..SenderConfig::from(cfg)
    };
    TransportSender::bind(config).expect("bind sender")
}

fn receiver_for(port: u16, cfg: &CastorConfig) -> TransportReceiver {
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    TransportReceiver::connect(ReceiverConfig::new(addr, cfg)).expect("connect")
}

fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let start = std::time::Instant::now();
    while !check() {
        assert!(start.elapsed() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn frame_bytes(len: usize, salt: u8) -> Bytes {
    Bytes::from(
        (0..len)
            .map(|i| ((i as u32 * 31 + salt as u32) % 256) as u8)
            .collect::<Vec<u8>>(),
    )
}

// ─── Full-Stack Tests ───────────────────────────────────────────────────────

#[test]
fn handshake_establishes_both_sides() {
    let cfg = CastorConfig::default();
    let sender = ephemeral_sender(&cfg);
    let receiver = receiver_for(sender.local_port(), &cfg);

    assert!(receiver.is_connected());
    wait_for("peer registration", Duration::from_secs(2), || {
        sender.peer_count() == 1
    });
}

#[test]
fn frames_arrive_byte_identical() {
    let cfg = CastorConfig::default();
    let sender = ephemeral_sender(&cfg);
    let receiver = receiver_for(sender.local_port(), &cfg);
    wait_for("peer registration", Duration::from_secs(2), || {
        sender.peer_count() == 1
    });

    // A mix of keyframes, multi-fragment and tiny frames.
    let frames: Vec<(u32, bool, Bytes)> = (0..10u32)
        .map(|i| {
            let len = match i % 3 {
                0 => 6000,
                1 => 100,
                _ => 2500,
            };
            (i, i % 5 == 0, frame_bytes(len, i as u8))
        })
        .collect();

    for (index, keyframe, data) in &frames {
        let queued = sender.send_video_frame(data.clone(), *index, *keyframe, 1280, 720);
        assert!(queued > 0, "frame {index} not queued");
    }

    let mut delivered = Vec::new();
    while delivered.len() < frames.len() {
        let frame = receiver
            .next_frame(Duration::from_secs(2))
            .expect("frame delivery timed out");
        delivered.push(frame);
    }

    // Loopback delivers in order; contents must match exactly.
    for ((index, keyframe, data), frame) in frames.iter().zip(&delivered) {
        assert_eq!(frame.frame_index, *index);
        assert_eq!(frame.is_keyframe, *keyframe);
        assert_eq!(&frame.data, data, "frame {index} corrupted");
    }

    let stats = receiver.stats();
    assert_eq!(stats.frames_delivered, 10);
    assert_eq!(stats.malformed_packets, 0);
}

#[test]
fn silent_client_expires_from_registry() {
    let cfg = CastorConfig {
        heartbeat_interval_ms: 100,
        inactivity_timeout_ms: 500,
        ..CastorConfig::default()
    };
    let sender = ephemeral_sender(&cfg);
    {
        let _receiver = receiver_for(sender.local_port(), &cfg);
        wait_for("peer registration", Duration::from_secs(2), || {
            sender.peer_count() == 1
        });
        // Receiver drops here and stops heartbeating.
    }
    wait_for("peer expiry", Duration::from_secs(3), || {
        sender.peer_count() == 0
    });
}

// ─── Scripted-Server Tests ──────────────────────────────────────────────────

/// A bare UDP socket that speaks just enough of the protocol to accept one
/// client and then follow a packet script.
struct ScriptedServer {
    socket: UdpSocket,
    client: SocketAddr,
}

impl ScriptedServer {
    /// Bind, then answer the connect heartbeat in a background-free way: the
    /// accept happens on this thread while `connect()` blocks on another.
    fn accept(cfg: &CastorConfig) -> (ScriptedServer, TransportReceiver) {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind scripted server");
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();

        let cfg: CastorConfig = (*cfg).clone();
        let connector = std::thread::spawn(move || receiver_for(port, &cfg));

        let mut buf = [0u8; 2048];
        let (len, client) = socket.recv_from(&mut buf).expect("connect heartbeat");
        let packet = Packet::decode(&buf[..len], DecodeMode::Lenient).expect("parse heartbeat");
        let hb = match packet {
            Packet::Heartbeat(hb) => hb,
            other => panic!("expected heartbeat, got {other:?}"),
        };

        let reply = Packet::Heartbeat(HeartbeatPacket {
            seq: 0,
            timestamp_ms: 1,
            stats: HeartbeatBody {
                echo_timestamp_ms: Some(hb.timestamp_ms),
                ..HeartbeatBody::default()
            },
        });
        socket.send_to(&reply.encode(), client).unwrap();

        let receiver = connector.join().expect("connector thread");
        (ScriptedServer { socket, client }, receiver)
    }

    fn send(&self, pkt: &Packet) {
        self.socket.send_to(&pkt.encode(), self.client).unwrap();
    }

    /// Wait for the next NACK from the client, skipping its heartbeats.
    fn expect_nack(&self, within: Duration) -> Vec<u32> {
        self.socket.set_read_timeout(Some(within)).unwrap();
        let mut buf = [0u8; 2048];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).expect("waiting for NACK");
            if let Ok(Packet::Control(ctrl)) = Packet::decode(&buf[..len], DecodeMode::Lenient) {
                if let ControlBody::Nack { missing_seqs } = ctrl.body {
                    return missing_seqs;
                }
            }
        }
    }
}

#[test]
fn reordered_fragments_deliver_one_exact_frame() {
    let cfg = CastorConfig::default();
    let (server, receiver) = ScriptedServer::accept(&cfg);

    let data = frame_bytes(5 * 900, 7);
    let packets = fragment_frame(data.clone(), 0, true, 900, 1, 10);
    assert_eq!(packets.len(), 5);

    for &i in &[4usize, 2, 0, 3, 1] {
        server.send(&Packet::Video(packets[i].clone()));
    }

    let frame = receiver
        .next_frame(Duration::from_secs(2))
        .expect("reordered frame");
    assert_eq!(frame.frame_index, 0);
    assert!(frame.is_keyframe);
    assert_eq!(frame.data, data);
}

#[test]
fn gap_provokes_nack_and_retransmit_completes_frame() {
    let cfg = CastorConfig::default();
    let (server, receiver) = ScriptedServer::accept(&cfg);

    let data = frame_bytes(4 * 1000, 3);
    let packets = fragment_frame(data.clone(), 0, false, 1000, 1, 10);
    assert_eq!(packets.len(), 4);

    // Withhold seq 2; send a trailing packet so the gap is visible.
    for (i, pkt) in packets.iter().enumerate() {
        if i != 1 {
            server.send(&Packet::Video(pkt.clone()));
        }
    }

    let missing = server.expect_nack(Duration::from_secs(2));
    assert!(missing.contains(&2), "nack {missing:?} should request seq 2");

    server.send(&Packet::Video(packets[1].clone()));
    let frame = receiver
        .next_frame(Duration::from_secs(2))
        .expect("frame after retransmit");
    assert_eq!(frame.data, data);
    assert!(receiver.stats().nacks_sent >= 1);
}

#[test]
fn fec_recovers_single_loss_without_retransmit() {
    let cfg = CastorConfig::default();
    let (server, receiver) = ScriptedServer::accept(&cfg);

    let data = frame_bytes(4 * 800, 9);
    let packets = fragment_frame(data.clone(), 0, false, 800, 1, 10);
    assert_eq!(packets.len(), 4);

    // Parity over the whole fragment run.
    let mut fec = FecEncoder::new(4, 1);
    let mut parity = Vec::new();
    for pkt in &packets {
        parity = fec.push(pkt.seq, pkt.fec_payload());
    }
    let parity = parity.remove(0);

    // Lose fragment 2 outright; parity takes seq 5 so no sequence gap is
    // left dangling after recovery.
    for (i, pkt) in packets.iter().enumerate() {
        if i != 2 {
            server.send(&Packet::Video(pkt.clone()));
        }
    }
    server.send(&Packet::Fec(FecPacket {
        seq: 5,
        timestamp_ms: 11,
        block_index: parity.block_index,
        source_seqs: parity.source_seqs,
        source_lens: parity.source_lens,
        parity: parity.parity,
    }));

    let frame = receiver
        .next_frame(Duration::from_secs(2))
        .expect("fec-recovered frame");
    assert_eq!(frame.data, data);

    wait_for("fec counter", Duration::from_secs(1), || {
        receiver.stats().fec_recovered == 1
    });
}

#[test]
fn fec_recovered_single_fragment_keyframe_keeps_flag() {
    let cfg = CastorConfig::default();
    let (server, receiver) = ScriptedServer::accept(&cfg);

    // Two single-fragment frames form one FEC block; the keyframe is lost.
    let filler = fragment_frame(frame_bytes(600, 1), 0, false, 1400, 1, 10);
    let keyframe = fragment_frame(frame_bytes(600, 2), 1, true, 1400, 2, 11);
    assert_eq!((filler.len(), keyframe.len()), (1, 1));

    let mut fec = FecEncoder::new(2, 1);
    fec.push(filler[0].seq, filler[0].fec_payload());
    let parity = fec
        .push(keyframe[0].seq, keyframe[0].fec_payload())
        .remove(0);

    server.send(&Packet::Video(filler[0].clone()));
    server.send(&Packet::Fec(FecPacket {
        seq: 3,
        timestamp_ms: 12,
        block_index: parity.block_index,
        source_seqs: parity.source_seqs,
        source_lens: parity.source_lens,
        parity: parity.parity,
    }));

    let first = receiver
        .next_frame(Duration::from_secs(2))
        .expect("filler frame");
    assert!(!first.is_keyframe);

    let recovered = receiver
        .next_frame(Duration::from_secs(2))
        .expect("recovered keyframe");
    assert_eq!(recovered.frame_index, 1);
    assert!(
        recovered.is_keyframe,
        "keyframe bit must survive FEC recovery of a single-fragment frame"
    );
    assert_eq!(recovered.data, frame_bytes(600, 2));
}
