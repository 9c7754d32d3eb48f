//! # Transport Receiver
//!
//! Client-side orchestration: validates and parses inbound datagrams,
//! reassembles frames (recovering single losses through FEC), requests
//! retransmits for observed gaps, and reports link measurements back to the
//! server in heartbeats.
//!
//! Thread layout:
//!
//! - **RX thread** — blocking socket reads; owns the reassembly table and
//!   FEC decoder outright, so the hot path takes no cross-thread locks
//!   beyond the gap tracker.
//! - **Ticker thread** — the 100 ms NACK cadence, the 1 s heartbeat cadence
//!   and the session sweep.
//!
//! Completed frames land in a bounded queue with the keyframe-preserving
//! drop policy; [`TransportReceiver::next_frame`] pops them in arrival
//! order.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context};
use quanta::Instant;
use tracing::{debug, info, warn};

use castor_common::{CastorConfig, EncoderParams, NetworkSnapshot};

use crate::arq::GapTracker;
use crate::fec::FecDecoder;
use crate::fragment::ReassemblyBuffer;
use crate::monitor::NetworkMonitor;
use crate::pool::{SequenceGenerator, TimestampClock};
use crate::queue::{BoundedQueue, PushOutcome};
use crate::session::{PeerRegistry, PeerState};
use crate::stats::{bump, ReceiverStats, ReceiverStatsSnapshot};
use crate::wire::{
    ControlBody, ControlPacket, DecodeMode, HeartbeatBody, HeartbeatPacket, Packet, VideoPacket,
};

pub use crate::fragment::CompressedFrame;

/// Socket read timeout; bounds shutdown latency.
const RX_POLL: Duration = Duration::from_millis(100);

/// Ticker granularity.
const TICK: Duration = Duration::from_millis(20);

/// Sentinel for "no heartbeat seen yet".
const NO_TIMESTAMP: u64 = u64::MAX;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Receiver knobs, usually projected from [`CastorConfig`].
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub server_addr: SocketAddr,
    pub nack_interval: Duration,
    pub retransmit_timeout: Duration,
    pub reorder_window: u32,
    pub max_presentation_delay: Duration,
    pub heartbeat_interval: Duration,
    pub inactivity_timeout: Duration,
    pub frame_queue_cap: usize,
    pub connect_timeout: Duration,
    pub decode_mode: DecodeMode,
}

impl ReceiverConfig {
    pub fn new(server_addr: SocketAddr, cfg: &CastorConfig) -> Self {
        ReceiverConfig {
            server_addr,
            nack_interval: cfg.nack_interval(),
            retransmit_timeout: cfg.retransmit_timeout(),
            reorder_window: cfg.reorder_window_frames,
            max_presentation_delay: cfg.max_presentation_delay(),
            heartbeat_interval: cfg.heartbeat_interval(),
            inactivity_timeout: cfg.inactivity_timeout(),
            frame_queue_cap: cfg.frame_queue_cap,
            connect_timeout: Duration::from_secs(5),
            decode_mode: DecodeMode::Lenient,
        }
    }
}

// ─── Shared State ───────────────────────────────────────────────────────────

struct Shared {
    config: ReceiverConfig,
    socket: UdpSocket,
    monitor: NetworkMonitor,
    stats: ReceiverStats,
    frame_queue: BoundedQueue<CompressedFrame>,
    gaps: Mutex<GapTracker>,
    session: Mutex<PeerRegistry>,
    latest_encoder_config: Mutex<Option<EncoderParams>>,
    seq: SequenceGenerator,
    clock: TimestampClock,
    /// Server's latest heartbeat timestamp, echoed back for RTT pairing.
    last_server_heartbeat: AtomicU64,
    received_frames: AtomicU64,
    running: AtomicBool,
}

impl Shared {
    fn session_state(&self) -> Option<PeerState> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&self.config.server_addr)
            .map(|entry| entry.state)
    }
}

// ─── Receiver ───────────────────────────────────────────────────────────────

/// Client-side transport endpoint.
pub struct TransportReceiver {
    shared: Arc<Shared>,
    rx_handle: Option<JoinHandle<()>>,
    tick_handle: Option<JoinHandle<()>>,
}

impl TransportReceiver {
    /// Bind an ephemeral port, start the worker threads, and block until the
    /// server answers the opening heartbeat. Fails after `connect_timeout`.
    pub fn connect(config: ReceiverConfig) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).context("failed to bind client socket")?;
        socket
            .set_read_timeout(Some(RX_POLL))
            .context("failed to set socket read timeout")?;

        let shared = Arc::new(Shared {
            frame_queue: BoundedQueue::new(config.frame_queue_cap),
            gaps: Mutex::new(GapTracker::new(
                config.nack_interval,
                config.retransmit_timeout,
            )),
            session: Mutex::new(PeerRegistry::new(config.inactivity_timeout)),
            latest_encoder_config: Mutex::new(None),
            seq: SequenceGenerator::new(),
            clock: TimestampClock::new(),
            monitor: NetworkMonitor::new(),
            stats: ReceiverStats::default(),
            last_server_heartbeat: AtomicU64::new(NO_TIMESTAMP),
            received_frames: AtomicU64::new(0),
            running: AtomicBool::new(true),
            socket,
            config,
        });

        shared
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .register_outbound(shared.config.server_addr, Instant::now());

        let rx_shared = shared.clone();
        let rx_handle = std::thread::Builder::new()
            .name("castor-client-rx".into())
            .spawn(move || rx_loop(rx_shared))
            .context("failed to spawn RX thread")?;

        let tick_shared = shared.clone();
        let tick_handle = std::thread::Builder::new()
            .name("castor-client-tick".into())
            .spawn(move || tick_loop(tick_shared))
            .context("failed to spawn ticker thread")?;

        let mut receiver = TransportReceiver {
            shared,
            rx_handle: Some(rx_handle),
            tick_handle: Some(tick_handle),
        };

        let deadline = Instant::now() + receiver.shared.config.connect_timeout;
        while receiver.shared.session_state() != Some(PeerState::Established) {
            if Instant::now() >= deadline {
                let server = receiver.shared.config.server_addr;
                receiver.shutdown();
                bail!("no heartbeat reply from {server} within connect timeout");
            }
            std::thread::sleep(TICK);
        }
        info!(server = %receiver.shared.config.server_addr, "connected");
        Ok(receiver)
    }

    /// Pop the next completed frame, waiting up to `timeout`.
    pub fn next_frame(&self, timeout: Duration) -> Option<CompressedFrame> {
        let frame = self.shared.frame_queue.pop_timeout(timeout)?;
        bump(&self.shared.stats.frames_delivered, 1);
        Some(frame)
    }

    /// Whether the server session is currently established.
    pub fn is_connected(&self) -> bool {
        self.shared.session_state() == Some(PeerState::Established)
    }

    /// Current link view.
    pub fn network_snapshot(&self) -> NetworkSnapshot {
        self.shared.monitor.snapshot()
    }

    pub fn stats(&self) -> ReceiverStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// The most recent encoder parameters announced by the server, if any.
    pub fn latest_encoder_config(&self) -> Option<EncoderParams> {
        *self
            .shared
            .latest_encoder_config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn local_port(&self) -> u16 {
        self.shared
            .socket
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(0)
    }

    /// Stop the worker threads and close the socket.
    pub fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.rx_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.tick_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TransportReceiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── RX Thread ──────────────────────────────────────────────────────────────

fn rx_loop(shared: Arc<Shared>) {
    let mut buf = [0u8; 65_535];
    let mut assembly = ReassemblyBuffer::new(
        shared.config.reorder_window,
        shared.config.max_presentation_delay,
    );
    let mut fec = FecDecoder::new();

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

        // Only the session's server may feed this socket.
        if from != shared.config.server_addr {
            bump(&shared.stats.foreign_datagrams, 1);
            continue;
        }

        bump(&shared.stats.packets_received, 1);
        bump(&shared.stats.bytes_received, len as u64);

        let packet = match Packet::decode(&buf[..len], shared.config.decode_mode) {
            Ok(p) => p,
            Err(err) => {
                debug!(error = %err, "dropping malformed datagram");
                bump(&shared.stats.malformed_packets, 1);
                continue;
            }
        };

        let now = Instant::now();
        shared.monitor.bytes_received(len);
        shared
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .observe_packet(from, now);

        match packet {
            Packet::Video(video) => {
                handle_video(&shared, &mut assembly, &mut fec, video, now);
            }
            Packet::Fec(parity) => {
                record_seq(&shared, parity.seq);
                let recovered = fec.push_parity(&parity);
                if let Some((seq, payload)) = recovered {
                    recover_video(&shared, &mut assembly, &mut fec, seq, &payload, now);
                }
            }
            Packet::Heartbeat(hb) => {
                // Heartbeats share the sequence space; record them so they
                // never read as video losses.
                record_seq(&shared, hb.seq);
                handle_heartbeat(&shared, hb);
            }
            Packet::Control(ctrl) => {
                record_seq(&shared, ctrl.seq);
                handle_control(&shared, ctrl);
            }
        }

        sync_stats(&shared, &assembly, &fec);
    }
}

/// Route one video packet: gap bookkeeping, FEC source registration (which
/// may itself complete an earlier block), then reassembly.
fn handle_video(
    shared: &Shared,
    assembly: &mut ReassemblyBuffer,
    fec: &mut FecDecoder,
    video: VideoPacket,
    now: Instant,
) {
    record_seq(shared, video.seq);

    let recovered = fec.observe_source(video.seq, video.fec_payload());
    if let Some(frame) = assembly.insert(&video, now) {
        deliver_frame(shared, frame);
    }
    if let Some((seq, payload)) = recovered {
        recover_video(shared, assembly, fec, seq, &payload, now);
    }
}

/// Feed a FEC-reconstructed payload back through the video path.
fn recover_video(
    shared: &Shared,
    assembly: &mut ReassemblyBuffer,
    fec: &mut FecDecoder,
    seq: u32,
    payload: &[u8],
    now: Instant,
) {
    match VideoPacket::from_recovered(seq, payload) {
        Ok(video) => {
            debug!(seq, frame = video.frame_index, "fec recovered packet");
            handle_video(shared, assembly, fec, video, now);
        }
        Err(err) => {
            debug!(seq, error = %err, "fec recovery produced unusable payload");
            bump(&shared.stats.malformed_packets, 1);
        }
    }
}

fn handle_heartbeat(shared: &Shared, hb: HeartbeatPacket) {
    shared
        .last_server_heartbeat
        .store(hb.timestamp_ms, Ordering::Relaxed);

    // The echoed token is our own clock reading at heartbeat-send time.
    // Sub-millisecond paths still count as 1 ms.
    if let Some(echo) = hb.stats.echo_timestamp_ms {
        let rtt_ms = shared.clock.now_ms().saturating_sub(echo).max(1);
        shared.monitor.rtt_sample(rtt_ms as f64);
    }
    shared
        .monitor
        .update_from_peer(hb.stats.rtt, hb.stats.packet_loss, hb.stats.bandwidth);
}

fn handle_control(shared: &Shared, ctrl: ControlPacket) {
    match ctrl.body {
        ControlBody::Config { params } => {
            info!(
                width = params.width,
                height = params.height,
                fps = params.fps,
                "server announced encoder reconfiguration"
            );
            *shared
                .latest_encoder_config
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(params);
        }
        ControlBody::Stats(stats) => {
            shared
                .monitor
                .update_from_peer(stats.rtt, stats.packet_loss, stats.bandwidth);
        }
        ControlBody::Ack | ControlBody::Nack { .. } => {
            // The server does not request retransmits from clients.
        }
    }
}

fn record_seq(shared: &Shared, seq: u32) {
    shared
        .gaps
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .record_received(seq);
}

fn deliver_frame(shared: &Shared, frame: CompressedFrame) {
    shared.received_frames.fetch_add(1, Ordering::Relaxed);
    match shared.frame_queue.push(frame) {
        PushOutcome::Queued => {}
        PushOutcome::DisplacedOld | PushOutcome::DroppedNew => {
            bump(&shared.stats.frames_dropped_queue, 1);
        }
    }
}

/// Mirror the RX-owned structures' counters into the shared stats block.
fn sync_stats(shared: &Shared, assembly: &ReassemblyBuffer, fec: &FecDecoder) {
    let reasm = assembly.stats();
    shared
        .stats
        .incomplete_frames
        .store(reasm.incomplete_frames, Ordering::Relaxed);
    shared
        .stats
        .late_frames
        .store(reasm.late_frames, Ordering::Relaxed);
    shared
        .stats
        .fec_recovered
        .store(fec.recovered_packets(), Ordering::Relaxed);
    shared
        .stats
        .unrecovered_blocks
        .store(fec.unrecovered_blocks(), Ordering::Relaxed);
}

// ─── Ticker Thread ──────────────────────────────────────────────────────────

fn tick_loop(shared: Arc<Shared>) {
    // First heartbeat goes out immediately; it is the connect probe.
    let mut last_heartbeat: Option<Instant> = None;

    while shared.running.load(Ordering::Relaxed) {
        let now = Instant::now();

        if let Some(batch) = shared
            .gaps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take_nack_batch(now)
        {
            send_nack(&shared, batch);
        }

        let heartbeat_due = last_heartbeat
            .map(|at| now.duration_since(at) >= shared.config.heartbeat_interval)
            .unwrap_or(true);
        if heartbeat_due {
            send_heartbeat(&shared);
            sweep_session(&shared, now);
            last_heartbeat = Some(now);
        }

        std::thread::sleep(TICK);
    }
}

fn send_nack(shared: &Shared, missing_seqs: Vec<u32>) {
    let count = missing_seqs.len();
    let pkt = Packet::Control(ControlPacket {
        seq: shared.seq.next(),
        timestamp_ms: shared.clock.now_ms(),
        body: ControlBody::Nack { missing_seqs },
    });
    match shared.socket.send_to(&pkt.encode(), shared.config.server_addr) {
        Ok(_) => {
            debug!(count, "nack sent");
            bump(&shared.stats.nacks_sent, 1);
        }
        Err(e) => warn!(error = %e, "nack send failed"),
    }
}

fn send_heartbeat(shared: &Shared) {
    let snapshot = shared.monitor.snapshot();
    let (missing, loss) = {
        let gaps = shared.gaps.lock().unwrap_or_else(|e| e.into_inner());
        (gaps.missing_count() as u64, gaps.loss_ratio())
    };
    // The gap tracker sees every hole in the sequence space; fold its view
    // into the loss window the snapshot reports from.
    shared.monitor.loss_sample(loss);

    let echo = match shared.last_server_heartbeat.load(Ordering::Relaxed) {
        NO_TIMESTAMP => None,
        ts => Some(ts),
    };
    let body = HeartbeatBody {
        rtt: snapshot.rtt_ms,
        packet_loss: snapshot.loss_ratio,
        bandwidth: snapshot.bandwidth_bps,
        queue_depth: shared.frame_queue.len() as u32,
        received_frames: shared.received_frames.load(Ordering::Relaxed),
        missing_packets: missing,
        echo_timestamp_ms: echo,
    };
    let pkt = Packet::Heartbeat(HeartbeatPacket {
        seq: shared.seq.next(),
        timestamp_ms: shared.clock.now_ms(),
        stats: body,
    });
    match shared.socket.send_to(&pkt.encode(), shared.config.server_addr) {
        Ok(_) => {
            bump(&shared.stats.heartbeats_sent, 1);
        }
        Err(e) => warn!(error = %e, "heartbeat send failed"),
    }
}

fn sweep_session(shared: &Shared, now: Instant) {
    let mut session = shared.session.lock().unwrap_or_else(|e| e.into_inner());
    let outcome = session.sweep(now);
    if !outcome.expired.is_empty() {
        warn!(server = %shared.config.server_addr, "server session expired, probing");
        // Keep probing; a revived server re-establishes on its next reply.
        session.register_outbound(shared.config.server_addr, now);
    }
}
