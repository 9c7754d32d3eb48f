//! # Transport Sender
//!
//! Server-side orchestration: fragments encoded frames, appends FEC parity,
//! paces datagrams onto the socket, serves NACK retransmits from the send
//! cache, and keeps the peer registry alive with heartbeats.
//!
//! Thread layout:
//!
//! - **TX thread** — sole authority over the peer registry and send cache.
//!   Drains peer events from the RX thread, retransmits ahead of fresh
//!   packets, paces the outgoing stream and emits heartbeats.
//! - **RX thread** — blocking socket reads; parses and forwards typed events
//!   over a bounded channel. Never touches shared mutable state directly.
//!
//! Frame submission happens on the encoder's thread through
//! [`TransportSender::send_video_frame`]; the bounded send queue decouples it
//! from socket I/O with a keyframe-preserving drop policy.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use quanta::Instant;
use tracing::{debug, info, trace, warn};

use castor_common::{CastorConfig, NetworkSnapshot};

use crate::fec::FecEncoder;
use crate::fragment::fragment_frame;
use crate::monitor::NetworkMonitor;
use crate::pacer::Pacer;
use crate::pool::{SendCache, SequenceGenerator, TimestampClock};
use crate::queue::{BoundedQueue, PushOutcome, QueueItem};
use crate::session::PeerRegistry;
use crate::stats::{bump, SenderStats, SenderStatsSnapshot};
use crate::wire::{
    ControlBody, DecodeMode, FecPacket, HeartbeatBody, HeartbeatPacket, Packet, PacketKind,
    ParseError, MAX_NACK_SEQS,
};

/// How many consecutive ports to try when the configured one is taken.
const BIND_ATTEMPTS: u16 = 10;

/// TX loop granularity; bounds shutdown latency.
const TX_POLL: Duration = Duration::from_millis(10);

/// RX socket read timeout; bounds shutdown latency.
const RX_POLL: Duration = Duration::from_millis(100);

/// Outgoing rate headroom over the encoder target, in bytes/sec terms.
const PACING_HEADROOM: f64 = 1.1;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Sender knobs, usually projected from [`CastorConfig`].
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub port: u16,
    pub min_payload: usize,
    pub max_payload: usize,
    pub fec_block_size: usize,
    pub fec_parity_count: usize,
    pub send_queue_cap: usize,
    pub event_queue_cap: usize,
    pub send_cache_depth: usize,
    pub heartbeat_interval: Duration,
    pub inactivity_timeout: Duration,
    pub start_bitrate: u64,
    pub decode_mode: DecodeMode,
}

impl From<&CastorConfig> for SenderConfig {
    fn from(cfg: &CastorConfig) -> Self {
        SenderConfig {
            port: cfg.port,
            min_payload: cfg.min_payload,
            max_payload: cfg.max_payload,
            fec_block_size: cfg.fec_block_size,
            fec_parity_count: cfg.fec_parity_count(),
            send_queue_cap: cfg.send_queue_cap,
            event_queue_cap: cfg.recv_queue_cap,
            send_cache_depth: cfg.send_cache_depth,
            heartbeat_interval: cfg.heartbeat_interval(),
            inactivity_timeout: cfg.inactivity_timeout(),
            start_bitrate: cfg.start_bitrate,
            decode_mode: DecodeMode::Lenient,
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig::from(&CastorConfig::default())
    }
}

// ─── Payload Sizing ─────────────────────────────────────────────────────────

/// Adaptive fragment payload size.
///
/// Shrinks with loss (up to half) and with RTT beyond 200 ms (down to 0.7 of
/// base), clamped into the configured bounds.
pub fn optimal_payload_size(snapshot: &NetworkSnapshot, min: usize, max: usize) -> usize {
    const BASE: f64 = 1200.0;
    let loss_factor = 1.0 - (snapshot.loss_ratio * 5.0).min(0.5);
    let rtt_factor = if snapshot.rtt_ms > 200.0 {
        (1.0 - (snapshot.rtt_ms - 200.0) / 1000.0).max(0.7)
    } else {
        1.0
    };
    ((BASE * loss_factor * rtt_factor) as usize).clamp(min, max)
}

// ─── Internal Types ─────────────────────────────────────────────────────────

/// One serialized datagram waiting for the TX thread.
struct OutboundPacket {
    seq: u32,
    kind: PacketKind,
    is_keyframe: bool,
    datagram: Bytes,
}

impl QueueItem for OutboundPacket {
    fn is_droppable_video(&self) -> bool {
        self.kind == PacketKind::Video && !self.is_keyframe
    }

    fn is_video(&self) -> bool {
        self.kind == PacketKind::Video
    }
}

/// Observations the RX thread hands to the TX authority.
enum PeerEvent {
    Heartbeat {
        from: std::net::SocketAddr,
        timestamp_ms: u64,
        stats: HeartbeatBody,
    },
    Nack {
        from: std::net::SocketAddr,
        missing_seqs: Vec<u32>,
    },
    Stats {
        from: std::net::SocketAddr,
        rtt: f64,
        packet_loss: f64,
        bandwidth: f64,
    },
    Touch {
        from: std::net::SocketAddr,
    },
}

struct Shared {
    config: SenderConfig,
    socket: UdpSocket,
    local_port: u16,
    seq: SequenceGenerator,
    clock: TimestampClock,
    monitor: NetworkMonitor,
    stats: SenderStats,
    send_queue: BoundedQueue<OutboundPacket>,
    fec: Mutex<FecEncoder>,
    peers: Mutex<PeerRegistry>,
    target_bitrate: AtomicU64,
    running: AtomicBool,
}

// ─── Sender ─────────────────────────────────────────────────────────────────

/// Server-side transport endpoint.
pub struct TransportSender {
    shared: Arc<Shared>,
    tx_handle: Option<JoinHandle<()>>,
    rx_handle: Option<JoinHandle<()>>,
}

impl TransportSender {
    /// Bind the UDP socket (scanning a few ports upward if the configured
    /// one is taken) and start the worker threads. A bind failure after all
    /// attempts is fatal and surfaced to the caller.
    pub fn bind(config: SenderConfig) -> anyhow::Result<Self> {
        let (socket, local_port) = bind_with_retry(config.port)
            .with_context(|| format!("failed to bind UDP port {}", config.port))?;
        socket
            .set_read_timeout(Some(RX_POLL))
            .context("failed to set socket read timeout")?;
        info!(port = local_port, "transport sender listening");

        let shared = Arc::new(Shared {
            send_queue: BoundedQueue::new(config.send_queue_cap),
            fec: Mutex::new(FecEncoder::new(
                config.fec_block_size,
                config.fec_parity_count,
            )),
            peers: Mutex::new(PeerRegistry::new(config.inactivity_timeout)),
            target_bitrate: AtomicU64::new(config.start_bitrate),
            running: AtomicBool::new(true),
            seq: SequenceGenerator::new(),
            clock: TimestampClock::new(),
            monitor: NetworkMonitor::new(),
            stats: SenderStats::default(),
            local_port,
            socket,
            config,
        });

        let (event_tx, event_rx) = bounded(shared.config.event_queue_cap);

        let tx_shared = shared.clone();
        let tx_handle = std::thread::Builder::new()
            .name("castor-tx".into())
            .spawn(move || tx_loop(tx_shared, event_rx))
            .context("failed to spawn TX thread")?;

        let rx_shared = shared.clone();
        let rx_handle = std::thread::Builder::new()
            .name("castor-rx".into())
            .spawn(move || rx_loop(rx_shared, event_tx))
            .context("failed to spawn RX thread")?;

        Ok(TransportSender {
            shared,
            tx_handle: Some(tx_handle),
            rx_handle: Some(rx_handle),
        })
    }

    /// Fragment, FEC-protect and enqueue one encoded frame.
    ///
    /// Returns the number of datagrams queued (fragments plus parity), or 0
    /// when no client is connected.
    pub fn send_video_frame(
        &self,
        data: Bytes,
        frame_index: u32,
        is_keyframe: bool,
        width: u32,
        height: u32,
    ) -> usize {
        let shared = &self.shared;
        if shared.peers.lock().unwrap_or_else(|e| e.into_inner()).is_empty() {
            trace!(frame = frame_index, "no peers, dropping frame");
            return 0;
        }

        let snapshot = shared.monitor.snapshot();
        let max_payload = optimal_payload_size(
            &snapshot,
            shared.config.min_payload,
            shared.config.max_payload,
        );

        let timestamp_ms = shared.clock.now_ms();
        let total = data.len().div_ceil(max_payload).max(1) as u32;
        let first_seq = shared.seq.reserve(total);
        let fragments = fragment_frame(
            data,
            frame_index,
            is_keyframe,
            max_payload,
            first_seq,
            timestamp_ms,
        );

        trace!(
            frame = frame_index,
            fragments = fragments.len(),
            max_payload,
            width,
            height,
            keyframe = is_keyframe,
            "frame fragmented"
        );

        let mut queued = 0;
        let mut parity_payloads = Vec::new();
        {
            let mut fec = shared.fec.lock().unwrap_or_else(|e| e.into_inner());
            for fragment in fragments {
                parity_payloads.extend(fec.push(fragment.seq, fragment.fec_payload()));
                queued += self.enqueue(OutboundPacket {
                    seq: fragment.seq,
                    kind: PacketKind::Video,
                    is_keyframe,
                    datagram: Packet::Video(fragment).encode().freeze(),
                });
            }
        }

        // Parity goes out after the frame's fragments so seqs stay in
        // transmit order; recovery latency is still a fraction of a frame.
        for parity in parity_payloads {
            let seq = shared.seq.next();
            let pkt = Packet::Fec(FecPacket {
                seq,
                timestamp_ms: shared.clock.now_ms(),
                block_index: parity.block_index,
                source_seqs: parity.source_seqs,
                source_lens: parity.source_lens,
                parity: parity.parity,
            });
            bump(&shared.stats.fec_parity_sent, 1);
            queued += self.enqueue(OutboundPacket {
                seq,
                kind: PacketKind::Fec,
                is_keyframe: false,
                datagram: pkt.encode().freeze(),
            });
        }

        bump(&shared.stats.frames_sent, 1);
        queued
    }

    /// Seal and enqueue parity for a partially filled FEC block.
    pub fn flush_fec(&self) -> usize {
        let shared = &self.shared;
        let parities = {
            let mut fec = shared.fec.lock().unwrap_or_else(|e| e.into_inner());
            fec.flush()
        };
        let mut queued = 0;
        for parity in parities {
            let seq = shared.seq.next();
            let pkt = Packet::Fec(FecPacket {
                seq,
                timestamp_ms: shared.clock.now_ms(),
                block_index: parity.block_index,
                source_seqs: parity.source_seqs,
                source_lens: parity.source_lens,
                parity: parity.parity,
            });
            bump(&shared.stats.fec_parity_sent, 1);
            queued += self.enqueue(OutboundPacket {
                seq,
                kind: PacketKind::Fec,
                is_keyframe: false,
                datagram: pkt.encode().freeze(),
            });
        }
        queued
    }

    /// Update the pacing target; normally driven by the encoder controller.
    pub fn set_target_bitrate(&self, bps: u64) {
        self.shared.target_bitrate.store(bps, Ordering::Relaxed);
    }

    /// Current link view for the encoder controller.
    pub fn network_snapshot(&self) -> NetworkSnapshot {
        self.shared.monitor.snapshot()
    }

    /// Short-horizon extrapolated link view.
    pub fn predicted_snapshot(&self, horizon: Duration) -> NetworkSnapshot {
        self.shared.monitor.predict(horizon)
    }

    pub fn stats(&self) -> SenderStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn peer_count(&self) -> usize {
        self.shared
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn local_port(&self) -> u16 {
        self.shared.local_port
    }

    /// Stop the worker threads and close the socket.
    pub fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.tx_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.rx_handle.take() {
            let _ = handle.join();
        }
    }

    fn enqueue(&self, packet: OutboundPacket) -> usize {
        let stats = &self.shared.stats;
        match self.shared.send_queue.push(packet) {
            PushOutcome::Queued => 1,
            PushOutcome::DisplacedOld => {
                bump(&stats.queue_dropped_old, 1);
                1
            }
            PushOutcome::DroppedNew => {
                bump(&stats.queue_dropped_new, 1);
                0
            }
        }
    }
}

impl Drop for TransportSender {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn bind_with_retry(port: u16) -> std::io::Result<(UdpSocket, u16)> {
    let mut last_err = None;
    for attempt in 0..BIND_ATTEMPTS {
        let candidate = port.saturating_add(attempt);
        match UdpSocket::bind(("0.0.0.0", candidate)) {
            Ok(socket) => {
                let local = socket.local_addr()?.port();
                if attempt > 0 {
                    warn!(wanted = port, bound = local, "configured port busy");
                }
                return Ok((socket, local));
            }
            Err(e) => {
                last_err = Some(e);
                // Port 0 asks the OS for an ephemeral port; retrying is
                // pointless if even that failed.
                if port == 0 {
                    break;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::other("no bind attempt made")))
}

// ─── TX Thread ──────────────────────────────────────────────────────────────

fn tx_loop(shared: Arc<Shared>, events: Receiver<PeerEvent>) {
    let mut cache = SendCache::new(shared.config.send_cache_depth);
    let mut retransmits: std::collections::VecDeque<OutboundPacket> =
        std::collections::VecDeque::new();
    let mut pacer = Pacer::new(
        PACING_HEADROOM * shared.config.start_bitrate as f64 / 8.0,
    );
    // Fire the first heartbeat on the first tick.
    let mut last_heartbeat: Option<Instant> = None;

    while shared.running.load(Ordering::Relaxed) {
        let rate =
            PACING_HEADROOM * shared.target_bitrate.load(Ordering::Relaxed) as f64 / 8.0;
        if (rate - pacer.rate()).abs() > f64::EPSILON {
            pacer.set_rate(rate);
        }

        while let Ok(event) = events.try_recv() {
            handle_peer_event(&shared, event, &mut cache, &mut retransmits);
        }

        let now = Instant::now();
        let heartbeat_due = last_heartbeat
            .map(|at| now.duration_since(at) >= shared.config.heartbeat_interval)
            .unwrap_or(true);
        if heartbeat_due {
            heartbeat_tick(&shared, now);
            last_heartbeat = Some(now);
        }

        shared
            .monitor
            .queue_depth(shared.send_queue.len() as u32);

        let packet = match retransmits.pop_front() {
            Some(p) => p,
            None => match shared.send_queue.pop_timeout(TX_POLL) {
                Some(p) => p,
                None => continue,
            },
        };

        // Pacing: sleep in bounded slices so shutdown stays responsive.
        while let Some(wait) = pacer.poll(packet.datagram.len(), Instant::now()) {
            if !shared.running.load(Ordering::Relaxed) {
                return;
            }
            std::thread::sleep(wait.min(RX_POLL));
        }

        transmit(&shared, &packet);
        cache.insert(packet.seq, packet.datagram.clone(), packet.is_keyframe);
    }
}

/// Send one datagram to every registered peer, evicting peers whose socket
/// rejects the write. A single failing peer never aborts the sender.
fn transmit(shared: &Shared, packet: &OutboundPacket) {
    let addrs = shared
        .peers
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .addrs();
    if addrs.is_empty() {
        return;
    }

    let mut sent_any = false;
    for addr in addrs {
        match shared.socket.send_to(&packet.datagram, addr) {
            Ok(_) => sent_any = true,
            Err(e) => {
                warn!(peer = %addr, error = %e, "send failed, evicting peer");
                shared
                    .peers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(addr);
                bump(&shared.stats.peers_evicted, 1);
            }
        }
    }

    if sent_any {
        shared.monitor.packet_sent(packet.seq);
        bump(&shared.stats.packets_sent, 1);
        bump(&shared.stats.bytes_sent, packet.datagram.len() as u64);
    }
}

fn handle_peer_event(
    shared: &Shared,
    event: PeerEvent,
    cache: &mut SendCache,
    retransmits: &mut std::collections::VecDeque<OutboundPacket>,
) {
    match event {
        PeerEvent::Heartbeat {
            from,
            timestamp_ms,
            stats,
        } => {
            if let Some(echo) = stats.echo_timestamp_ms {
                // Sub-millisecond paths still count as 1 ms; the wire clock
                // cannot resolve finer.
                let rtt = shared.clock.now_ms().saturating_sub(echo).max(1);
                shared.monitor.rtt_sample(rtt as f64);
            }
            shared
                .monitor
                .update_from_peer(stats.rtt, stats.packet_loss, stats.bandwidth);
            shared
                .peers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .observe_heartbeat(from, stats, timestamp_ms, Instant::now());

            // Immediate reply so the client's connect() and RTT pairing work
            // without waiting for the periodic tick.
            send_heartbeat_to(shared, from, Some(timestamp_ms));
        }
        PeerEvent::Nack { from, missing_seqs } => {
            bump(&shared.stats.nacks_received, 1);
            shared
                .peers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .observe_packet(from, Instant::now());

            // Oversized requests are truncated, never rejected.
            let requested = missing_seqs.len().min(MAX_NACK_SEQS);
            for &seq in &missing_seqs[..requested] {
                match cache.get(seq) {
                    Some(entry) => {
                        trace!(seq, peer = %from, "retransmitting");
                        retransmits.push_back(OutboundPacket {
                            seq,
                            kind: PacketKind::Video,
                            is_keyframe: entry.is_keyframe,
                            datagram: entry.datagram.clone(),
                        });
                        bump(&shared.stats.retransmissions, 1);
                    }
                    None => {
                        // Evicted from the cache; the receiver will time the
                        // slot out and declare the packet lost.
                        bump(&shared.stats.retransmit_misses, 1);
                    }
                }
            }
        }
        PeerEvent::Stats {
            from,
            rtt,
            packet_loss,
            bandwidth,
        } => {
            shared.monitor.update_from_peer(rtt, packet_loss, bandwidth);
            shared
                .peers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .observe_packet(from, Instant::now());
        }
        PeerEvent::Touch { from } => {
            shared
                .peers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .observe_packet(from, Instant::now());
        }
    }
}

/// Periodic heartbeat fan-out plus liveness sweep.
fn heartbeat_tick(shared: &Shared, now: Instant) {
    let (addrs, expired) = {
        let mut peers = shared.peers.lock().unwrap_or_else(|e| e.into_inner());
        let outcome = peers.sweep(now);
        (
            peers
                .addrs()
                .into_iter()
                .map(|addr| (addr, peers.get(&addr).and_then(|p| p.last_heartbeat_ts)))
                .collect::<Vec<_>>(),
            outcome.expired,
        )
    };

    for peer in expired {
        warn!(peer = %peer.addr, "peer expired for inactivity");
        bump(&shared.stats.peers_evicted, 1);
    }

    for (addr, echo) in addrs {
        send_heartbeat_to(shared, addr, echo);
    }
}

fn send_heartbeat_to(shared: &Shared, addr: std::net::SocketAddr, echo: Option<u64>) {
    let snapshot = shared.monitor.snapshot();
    let body = HeartbeatBody {
        rtt: snapshot.rtt_ms,
        packet_loss: snapshot.loss_ratio,
        bandwidth: snapshot.bandwidth_bps,
        queue_depth: shared.send_queue.len() as u32,
        received_frames: 0,
        missing_packets: 0,
        echo_timestamp_ms: echo,
    };
    let pkt = Packet::Heartbeat(HeartbeatPacket {
        seq: shared.seq.next(),
        timestamp_ms: shared.clock.now_ms(),
        stats: body,
    });
    match shared.socket.send_to(&pkt.encode(), addr) {
        Ok(_) => {
            bump(&shared.stats.heartbeats_sent, 1);
        }
        Err(e) => {
            warn!(peer = %addr, error = %e, "heartbeat send failed, evicting peer");
            shared
                .peers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(addr);
            bump(&shared.stats.peers_evicted, 1);
        }
    }
}

// ─── RX Thread ──────────────────────────────────────────────────────────────

fn rx_loop(shared: Arc<Shared>, events: Sender<PeerEvent>) {
    let mut buf = [0u8; 65_535];

    while shared.running.load(Ordering::Relaxed) {
        let (len, from) = match shared.socket.recv_from(&mut buf) {
            Ok(ok) => ok,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!(error = %e, "socket receive error");
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
        };

        let packet = match Packet::decode(&buf[..len], shared.config.decode_mode) {
            Ok(p) => p,
            Err(err) => {
                count_malformed(&shared, &err);
                continue;
            }
        };

        shared.monitor.bytes_received(len);

        let event = match packet {
            Packet::Heartbeat(hb) => PeerEvent::Heartbeat {
                from,
                timestamp_ms: hb.timestamp_ms,
                stats: hb.stats,
            },
            Packet::Control(ctrl) => match ctrl.body {
                ControlBody::Nack { missing_seqs } => PeerEvent::Nack { from, missing_seqs },
                ControlBody::Stats(stats) => PeerEvent::Stats {
                    from,
                    rtt: stats.rtt,
                    packet_loss: stats.packet_loss,
                    bandwidth: stats.bandwidth,
                },
                ControlBody::Ack | ControlBody::Config { .. } => PeerEvent::Touch { from },
            },
            // Clients do not stream video at the server.
            Packet::Video(_) | Packet::Fec(_) => {
                debug!(peer = %from, "unexpected media packet at sender");
                continue;
            }
        };

        match events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                bump(&shared.stats.events_dropped, 1);
            }
            Err(TrySendError::Disconnected(_)) => return,
        }
    }
}

fn count_malformed(shared: &Shared, err: &ParseError) {
    debug!(error = %err, "dropping malformed datagram");
    bump(&shared.stats.malformed_packets, 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use castor_common::QualityClass;

    fn snapshot(rtt_ms: f64, loss: f64) -> NetworkSnapshot {
        NetworkSnapshot {
            rtt_ms,
            rtt_jitter_ms: 0.0,
            loss_ratio: loss,
            bandwidth_bps: 5_000_000.0,
            congestion: 0.0,
            quality: QualityClass::Good,
            timestamp_ms: 0,
        }
    }

    // ─── Payload Sizing ─────────────────────────────────────────────────

    #[test]
    fn clean_link_uses_base_payload() {
        assert_eq!(optimal_payload_size(&snapshot(20.0, 0.0), 500, 1400), 1200);
    }

    #[test]
    fn loss_shrinks_payload() {
        // 5% loss: factor 0.75.
        assert_eq!(optimal_payload_size(&snapshot(20.0, 0.05), 500, 1400), 900);
        // 10%+ loss saturates at half the base.
        assert_eq!(optimal_payload_size(&snapshot(20.0, 0.3), 500, 1400), 600);
    }

    #[test]
    fn rtt_spike_floors_near_840() {
        // Far past 200 ms the rtt factor bottoms out at 0.7.
        assert_eq!(optimal_payload_size(&snapshot(600.0, 0.0), 500, 1400), 840);
        // Below 200 ms RTT has no effect.
        assert_eq!(optimal_payload_size(&snapshot(199.0, 0.0), 500, 1400), 1200);
    }

    #[test]
    fn payload_clamped_to_bounds() {
        // Loss and RTT together would go below the floor.
        let tiny = optimal_payload_size(&snapshot(900.0, 0.5), 560, 1400);
        assert_eq!(tiny, 560);
        let capped = optimal_payload_size(&snapshot(20.0, 0.0), 500, 1000);
        assert_eq!(capped, 1000);
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    #[test]
    fn bind_on_ephemeral_port() {
        let config = SenderConfig {
            port: 0,
            ..SenderConfig::default()
        };
        let mut sender = TransportSender::bind(config).unwrap();
        assert_ne!(sender.local_port(), 0);
        assert_eq!(sender.peer_count(), 0);
        sender.shutdown();
    }

    #[test]
    fn frame_without_peers_is_dropped() {
        let config = SenderConfig {
            port: 0,
            ..SenderConfig::default()
        };
        let sender = TransportSender::bind(config).unwrap();
        let queued = sender.send_video_frame(Bytes::from(vec![0u8; 5000]), 0, true, 1280, 720);
        assert_eq!(queued, 0);
        assert_eq!(sender.stats().frames_sent, 0);
    }

    // ─── NACK Handling ──────────────────────────────────────────────────

    fn bare_shared() -> Shared {
        let config = SenderConfig::default();
        Shared {
            send_queue: BoundedQueue::new(config.send_queue_cap),
            fec: Mutex::new(FecEncoder::new(
                config.fec_block_size,
                config.fec_parity_count,
            )),
            peers: Mutex::new(PeerRegistry::new(config.inactivity_timeout)),
            target_bitrate: AtomicU64::new(config.start_bitrate),
            running: AtomicBool::new(false),
            seq: SequenceGenerator::new(),
            clock: TimestampClock::new(),
            monitor: NetworkMonitor::new(),
            stats: SenderStats::default(),
            local_port: 0,
            socket: UdpSocket::bind("127.0.0.1:0").unwrap(),
            config,
        }
    }

    #[test]
    fn oversized_nack_truncated_to_100() {
        let shared = bare_shared();
        let mut cache = SendCache::new(512);
        for seq in 0..150u32 {
            cache.insert(seq, Bytes::from(vec![seq as u8]), false);
        }

        let mut retransmits = std::collections::VecDeque::new();
        handle_peer_event(
            &shared,
            PeerEvent::Nack {
                from: "127.0.0.1:9999".parse().unwrap(),
                missing_seqs: (0..120).collect(),
            },
            &mut cache,
            &mut retransmits,
        );

        assert_eq!(retransmits.len(), 100, "requests past 100 are dropped");
        assert_eq!(shared.stats.snapshot().retransmissions, 100);
        assert_eq!(retransmits[0].seq, 0);
        assert_eq!(retransmits[99].seq, 99);
    }

    #[test]
    fn nack_for_evicted_seq_is_silent_miss() {
        let shared = bare_shared();
        let mut cache = SendCache::new(4);
        for seq in 0..8u32 {
            cache.insert(seq, Bytes::from(vec![seq as u8]), false);
        }

        let mut retransmits = std::collections::VecDeque::new();
        handle_peer_event(
            &shared,
            PeerEvent::Nack {
                from: "127.0.0.1:9999".parse().unwrap(),
                missing_seqs: vec![0, 1, 6, 7],
            },
            &mut cache,
            &mut retransmits,
        );

        // Seqs 0 and 1 aged out of the 4-deep cache.
        assert_eq!(retransmits.len(), 2);
        let stats = shared.stats.snapshot();
        assert_eq!(stats.retransmissions, 2);
        assert_eq!(stats.retransmit_misses, 2);
    }

    #[test]
    fn retransmitted_datagram_is_byte_identical() {
        let shared = bare_shared();
        let mut cache = SendCache::new(8);
        let original = Packet::Video(crate::wire::VideoPacket {
            seq: 3,
            timestamp_ms: 777,
            flags: crate::wire::flags::KEYFRAME | crate::wire::flags::FRAGMENT_END,
            frame_index: 1,
            fragment_index: 0,
            total_fragments: 1,
            data: Bytes::from_static(b"payload"),
        })
        .encode()
        .freeze();
        cache.insert(3, original.clone(), true);

        let mut retransmits = std::collections::VecDeque::new();
        handle_peer_event(
            &shared,
            PeerEvent::Nack {
                from: "127.0.0.1:9999".parse().unwrap(),
                missing_seqs: vec![3],
            },
            &mut cache,
            &mut retransmits,
        );

        assert_eq!(retransmits[0].datagram, original);
        assert!(retransmits[0].is_keyframe);
    }
}
