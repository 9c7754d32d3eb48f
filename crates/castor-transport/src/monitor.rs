//! # Network Monitor
//!
//! Per-peer link model: RTT mean/deviation, loss ratio, receive bandwidth,
//! and a composite congestion score, all over sliding sample windows. A
//! hysteresis classifier maps the measurements onto a coarse quality class
//! and a short-horizon predictor extrapolates the trend.
//!
//! Every entry point is non-blocking: state lives behind one internal mutex
//! and readers get cheap [`NetworkSnapshot`] copies. The monitor is owned by
//! its transport; the encoder controller only ever sees snapshots.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use quanta::Instant;
use tracing::debug;

use castor_common::{NetworkSnapshot, QualityClass};

use crate::stats::Ewma;

/// Sliding window length for rtt/loss/bandwidth samples.
const SAMPLE_WINDOW: usize = 100;

/// Predictor history length.
const PREDICTOR_WINDOW: usize = 10;

/// Minimum spacing between predictor history points.
const PREDICTOR_SPACING: Duration = Duration::from_millis(100);

/// Bound on the in-flight send-tracking map.
const IN_FLIGHT_CAP: usize = 4096;

/// Bandwidth is rolled up once at least this much time has accumulated.
const BANDWIDTH_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive agreeing classifications required to commit a class change.
const CLASS_AGREEMENT: u32 = 3;

// ─── Classifier ──────────────────────────────────────────────────────────────

/// (max rtt ms, max loss, min bandwidth bps) per class, best to worst.
const CLASS_THRESHOLDS: &[(QualityClass, f64, f64, f64)] = &[
    (QualityClass::Excellent, 50.0, 0.01, 10_000_000.0),
    (QualityClass::Good, 100.0, 0.02, 5_000_000.0),
    (QualityClass::Fair, 200.0, 0.05, 2_000_000.0),
    (QualityClass::Poor, 300.0, 0.10, 1_000_000.0),
];

/// Stateless threshold classification.
///
/// `bandwidth` of `f64::INFINITY` means "not yet measured" and satisfies
/// every bandwidth floor.
fn classify(rtt_ms: f64, loss: f64, bandwidth_bps: f64) -> QualityClass {
    for &(class, max_rtt, max_loss, min_bw) in CLASS_THRESHOLDS {
        if rtt_ms <= max_rtt && loss <= max_loss && bandwidth_bps >= min_bw {
            return class;
        }
    }
    QualityClass::VeryPoor
}

/// Commits a class change only after [`CLASS_AGREEMENT`] consecutive samples
/// agree, so a single spike never flips the encoder tier.
#[derive(Debug)]
struct HysteresisClassifier {
    current: QualityClass,
    candidate: QualityClass,
    agreement: u32,
}

impl HysteresisClassifier {
    fn new() -> Self {
        HysteresisClassifier {
            current: QualityClass::Good,
            candidate: QualityClass::Good,
            agreement: 0,
        }
    }

    /// Feed one classification sample. Returns true when the committed class
    /// changed.
    fn observe(&mut self, class: QualityClass) -> bool {
        if class == self.current {
            self.candidate = self.current;
            self.agreement = 0;
            return false;
        }
        if class == self.candidate {
            self.agreement += 1;
        } else {
            self.candidate = class;
            self.agreement = 1;
        }
        if self.agreement >= CLASS_AGREEMENT {
            debug!(from = %self.current, to = %class, "quality class changed");
            self.current = class;
            self.agreement = 0;
            return true;
        }
        false
    }
}

// ─── Monitor ─────────────────────────────────────────────────────────────────

struct SentRecord {
    at: Instant,
}

struct HistoryPoint {
    at: Instant,
    rtt_ms: f64,
    loss: f64,
    bandwidth_bps: f64,
}

struct Inner {
    rtt_window: VecDeque<f64>,
    loss_window: VecDeque<f64>,
    bandwidth_window: VecDeque<f64>,
    bandwidth_ewma: Ewma,
    queue_window: VecDeque<u32>,

    in_flight: HashMap<u32, SentRecord>,
    in_flight_order: VecDeque<u32>,
    sent_count: u64,
    observed_count: u64,

    bytes_received: u64,
    last_bandwidth_at: Instant,

    classifier: HysteresisClassifier,

    history: VecDeque<HistoryPoint>,
    last_history_at: Option<Instant>,
}

/// Link monitor for one peer.
pub struct NetworkMonitor {
    epoch: Instant,
    inner: Mutex<Inner>,
}

impl NetworkMonitor {
    pub fn new() -> Self {
        let now = Instant::now();
        NetworkMonitor {
            epoch: now,
            inner: Mutex::new(Inner {
                rtt_window: VecDeque::with_capacity(SAMPLE_WINDOW),
                loss_window: VecDeque::with_capacity(SAMPLE_WINDOW),
                bandwidth_window: VecDeque::with_capacity(SAMPLE_WINDOW),
                bandwidth_ewma: Ewma::new(0.3),
                queue_window: VecDeque::with_capacity(SAMPLE_WINDOW),
                in_flight: HashMap::new(),
                in_flight_order: VecDeque::new(),
                sent_count: 0,
                observed_count: 0,
                bytes_received: 0,
                last_bandwidth_at: now,
                classifier: HysteresisClassifier::new(),
                history: VecDeque::with_capacity(PREDICTOR_WINDOW),
                last_history_at: None,
            }),
        }
    }

    /// Milliseconds since this monitor's epoch.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Track an outgoing packet for return-path pairing.
    pub fn packet_sent(&self, seq: u32) {
        self.packet_sent_at(seq, Instant::now());
    }

    pub(crate) fn packet_sent_at(&self, seq: u32, now: Instant) {
        let mut inner = self.lock();
        inner.sent_count += 1;
        inner.in_flight.insert(seq, SentRecord { at: now });
        inner.in_flight_order.push_back(seq);
        while inner.in_flight_order.len() > IN_FLIGHT_CAP {
            if let Some(old) = inner.in_flight_order.pop_front() {
                inner.in_flight.remove(&old);
            }
        }
    }

    /// A tracked seq was observed on the return path: produce an RTT sample
    /// and a loss sample from the observed/sent ratio.
    pub fn packet_observed(&self, seq: u32) {
        self.packet_observed_at(seq, Instant::now());
    }

    pub(crate) fn packet_observed_at(&self, seq: u32, now: Instant) {
        let mut inner = self.lock();
        let Some(record) = inner.in_flight.remove(&seq) else {
            return;
        };
        inner.observed_count += 1;
        let rtt_ms = now.duration_since(record.at).as_secs_f64() * 1000.0;
        push_window(&mut inner.rtt_window, rtt_ms);
        let loss = 1.0 - inner.observed_count as f64 / inner.sent_count.max(1) as f64;
        push_window(&mut inner.loss_window, loss.clamp(0.0, 1.0));
    }

    /// Account received wire bytes toward the bandwidth estimate.
    pub fn bytes_received(&self, len: usize) {
        self.bytes_received_at(len, Instant::now());
    }

    pub(crate) fn bytes_received_at(&self, len: usize, now: Instant) {
        let mut inner = self.lock();
        inner.bytes_received += len as u64;

        let elapsed = now.duration_since(inner.last_bandwidth_at);
        if elapsed >= BANDWIDTH_INTERVAL {
            let bps = inner.bytes_received as f64 * 8.0 / elapsed.as_secs_f64();
            push_window(&mut inner.bandwidth_window, bps);
            inner.bandwidth_ewma.update(bps);
            inner.bytes_received = 0;
            inner.last_bandwidth_at = now;
            self.after_update(&mut inner, now);
        }
    }

    /// Direct RTT sample, e.g. from a heartbeat timestamp echo.
    pub fn rtt_sample(&self, rtt_ms: f64) {
        self.rtt_sample_at(rtt_ms, Instant::now());
    }

    pub(crate) fn rtt_sample_at(&self, rtt_ms: f64, now: Instant) {
        if rtt_ms < 0.0 {
            return;
        }
        let mut inner = self.lock();
        push_window(&mut inner.rtt_window, rtt_ms);
        self.after_update(&mut inner, now);
    }

    /// Direct loss-ratio sample, e.g. from the receiver's gap tracker.
    pub fn loss_sample(&self, ratio: f64) {
        let mut inner = self.lock();
        push_window(&mut inner.loss_window, ratio.clamp(0.0, 1.0));
    }

    /// Current transmit queue depth, for the congestion score.
    pub fn queue_depth(&self, depth: u32) {
        let mut inner = self.lock();
        push_window(&mut inner.queue_window, depth);
    }

    /// Fold in the peer's own measurements from a heartbeat or STATS body.
    pub fn update_from_peer(&self, rtt_ms: f64, loss: f64, bandwidth_bps: f64) {
        self.update_from_peer_at(rtt_ms, loss, bandwidth_bps, Instant::now());
    }

    pub(crate) fn update_from_peer_at(
        &self,
        rtt_ms: f64,
        loss: f64,
        bandwidth_bps: f64,
        now: Instant,
    ) {
        let mut inner = self.lock();
        if rtt_ms > 0.0 {
            push_window(&mut inner.rtt_window, rtt_ms);
        }
        push_window(&mut inner.loss_window, loss.clamp(0.0, 1.0));
        if bandwidth_bps > 0.0 {
            push_window(&mut inner.bandwidth_window, bandwidth_bps);
            inner.bandwidth_ewma.update(bandwidth_bps);
        }
        self.after_update(&mut inner, now);
    }

    /// Copy out the current view of the link.
    pub fn snapshot(&self) -> NetworkSnapshot {
        let inner = self.lock();
        self.snapshot_inner(&inner)
    }

    /// Linear extrapolation of (rtt, loss, bandwidth) `horizon` ahead,
    /// clamped to valid ranges. Falls back to the current snapshot when the
    /// history is too short to carry a trend.
    pub fn predict(&self, horizon: Duration) -> NetworkSnapshot {
        let inner = self.lock();
        let mut snap = self.snapshot_inner(&inner);

        let (Some(first), Some(last)) = (inner.history.front(), inner.history.back()) else {
            return snap;
        };
        let dt = last.at.duration_since(first.at).as_secs_f64();
        if dt <= 0.0 {
            return snap;
        }

        let ahead = horizon.as_secs_f64();
        let extrapolate = |a: f64, b: f64| b + (b - a) / dt * ahead;

        snap.rtt_ms = extrapolate(first.rtt_ms, last.rtt_ms).max(0.0);
        snap.loss_ratio = extrapolate(first.loss, last.loss).clamp(0.0, 1.0);
        snap.bandwidth_bps = extrapolate(first.bandwidth_bps, last.bandwidth_bps).max(0.0);
        snap
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Monitor state is plain data; a poisoned lock means a panicking
        // stats reader, and the data is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Classification + predictor bookkeeping after a measurement update.
    fn after_update(&self, inner: &mut Inner, now: Instant) {
        let rtt = mean(&inner.rtt_window);
        let loss = mean(&inner.loss_window);
        let bandwidth = if inner.bandwidth_window.is_empty() {
            f64::INFINITY
        } else {
            inner.bandwidth_ewma.value()
        };
        inner.classifier.observe(classify(rtt, loss, bandwidth));

        let due = match inner.last_history_at {
            None => true,
            Some(at) => now.duration_since(at) >= PREDICTOR_SPACING,
        };
        if due {
            inner.history.push_back(HistoryPoint {
                at: now,
                rtt_ms: rtt,
                loss,
                bandwidth_bps: if bandwidth.is_finite() { bandwidth } else { 0.0 },
            });
            if inner.history.len() > PREDICTOR_WINDOW {
                inner.history.pop_front();
            }
            inner.last_history_at = Some(now);
        }
    }

    fn snapshot_inner(&self, inner: &Inner) -> NetworkSnapshot {
        let rtt_ms = mean(&inner.rtt_window);
        NetworkSnapshot {
            rtt_ms,
            rtt_jitter_ms: std_dev(&inner.rtt_window, rtt_ms),
            loss_ratio: mean(&inner.loss_window),
            bandwidth_bps: if inner.bandwidth_ewma.is_initialized() {
                inner.bandwidth_ewma.value()
            } else {
                0.0
            },
            congestion: congestion_level(inner),
            quality: inner.classifier.current,
            timestamp_ms: self.now_ms(),
        }
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// 0.7 · normalized-RTT + 0.3 · normalized-queue-depth, clamped to [0, 1].
/// RTT normalizes against the window min/max, queue depth against its max.
fn congestion_level(inner: &Inner) -> f64 {
    if inner.rtt_window.is_empty() || inner.queue_window.is_empty() {
        return 0.0;
    }

    let rtt_min = inner.rtt_window.iter().copied().fold(f64::MAX, f64::min);
    let rtt_max = inner.rtt_window.iter().copied().fold(f64::MIN, f64::max);
    let rtt_norm = if rtt_max > rtt_min {
        (mean(&inner.rtt_window) - rtt_min) / (rtt_max - rtt_min)
    } else {
        0.0
    };

    let queue_max = inner.queue_window.iter().copied().max().unwrap_or(0);
    let queue_norm = if queue_max > 0 {
        let sum: u64 = inner.queue_window.iter().map(|&q| q as u64).sum();
        sum as f64 / (inner.queue_window.len() as f64 * queue_max as f64)
    } else {
        0.0
    };

    (0.7 * rtt_norm + 0.3 * queue_norm).clamp(0.0, 1.0)
}

fn push_window<T>(window: &mut VecDeque<T>, value: T) {
    window.push_back(value);
    if window.len() > SAMPLE_WINDOW {
        window.pop_front();
    }
}

fn mean(window: &VecDeque<f64>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    window.iter().sum::<f64>() / window.len() as f64
}

fn std_dev(window: &VecDeque<f64>, mean: f64) -> f64 {
    if window.len() < 2 {
        return 0.0;
    }
    let var = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / window.len() as f64;
    var.sqrt()
}
