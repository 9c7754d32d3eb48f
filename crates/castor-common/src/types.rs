//! Snapshot and parameter types shared across the stack.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse link-health label used to pick the encoder tier.
///
/// Classification lives in the transport's network monitor; the variants are
/// shared so the controller can log and react to them without a transport
/// dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityClass {
    Excellent,
    Good,
    Fair,
    Poor,
    VeryPoor,
}

impl fmt::Display for QualityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QualityClass::Excellent => "excellent",
            QualityClass::Good => "good",
            QualityClass::Fair => "fair",
            QualityClass::Poor => "poor",
            QualityClass::VeryPoor => "very_poor",
        };
        f.write_str(name)
    }
}

/// Read-only copy of the network monitor's current view of one peer link.
///
/// Produced by the transport, consumed by the encoder controller. All fields
/// are plain values so the snapshot can cross thread boundaries freely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    /// Mean round-trip time over the sample window (ms).
    pub rtt_ms: f64,
    /// Standard deviation of RTT over the window (ms).
    pub rtt_jitter_ms: f64,
    /// Observed loss ratio in [0, 1].
    pub loss_ratio: f64,
    /// Smoothed receive bandwidth (bits/sec).
    pub bandwidth_bps: f64,
    /// Composite congestion score in [0, 1].
    pub congestion: f64,
    /// Hysteresis-stabilized quality class.
    pub quality: QualityClass,
    /// Milliseconds since the monitor's epoch when this snapshot was taken.
    pub timestamp_ms: u64,
}

impl NetworkSnapshot {
    /// A neutral snapshot used before any sample has arrived.
    pub fn initial() -> Self {
        NetworkSnapshot {
            rtt_ms: 100.0,
            loss_ratio: 0.01,
            rtt_jitter_ms: 0.0,
            bandwidth_bps: 5_000_000.0,
            congestion: 0.0,
            quality: QualityClass::Good,
            timestamp_ms: 0,
        }
    }
}

/// Parameters handed to the external codec on (re)configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Target bitrate (bps).
    pub bitrate: u64,
    /// Keyframe interval in frames.
    pub gop: u32,
    /// Base quantization parameter; ROI deltas apply on top.
    pub base_qp: u8,
}

impl EncoderParams {
    /// Whether switching to `next` requires a full encoder reinit rather than
    /// a bitrate-only update.
    pub fn needs_reinit(&self, next: &EncoderParams) -> bool {
        self.width != next.width || self.height != next.height || self.fps != next.fps
    }
}
