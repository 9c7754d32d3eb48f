//! Runtime configuration.
//!
//! All tunables of the transport and encoder stack in one serde struct.
//! Every field has a default, so an empty TOML document is a valid config.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("fec_overhead {0} outside [0.05, 0.5]")]
    FecOverhead(f64),
    #[error("fec_block_size must be >= 2, got {0}")]
    FecBlockSize(usize),
    #[error("payload bounds inverted: min {min} > max {max}")]
    PayloadBounds { min: usize, max: usize },
    #[error("video dimensions must be non-zero: {0}x{1}")]
    VideoDimensions(u32, u32),
    #[error("bitrate bounds inverted: min {min} > max {max}")]
    BitrateBounds { min: u64, max: u64 },
}

/// Full Castor configuration.
///
/// Durations are stored as integer milliseconds to keep the TOML surface flat;
/// accessor methods convert to [`Duration`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CastorConfig {
    /// UDP listen/bind port on the server.
    pub port: u16,
    /// Native capture width in pixels.
    pub video_width: u32,
    /// Native capture height in pixels.
    pub video_height: u32,
    /// Capture/encode target frame rate.
    pub target_fps: u32,

    /// Lower bound for the adaptive fragment payload size (bytes).
    pub min_payload: usize,
    /// Upper bound for the adaptive fragment payload size (bytes).
    pub max_payload: usize,

    /// Source packets per FEC block.
    pub fec_block_size: usize,
    /// Parity ratio, valid range [0.05, 0.5].
    pub fec_overhead: f64,

    /// Minimum gap between NACK emissions (ms).
    pub nack_interval_ms: u64,
    /// How long a NACKed seq may stay outstanding before it is re-queued (ms).
    pub retransmit_timeout_ms: u64,

    /// How far behind the newest frame an incomplete assembly survives.
    pub reorder_window_frames: u32,
    /// A frame whose last fragment lands later than this after its first is
    /// dropped (ms).
    pub max_presentation_delay_ms: u64,

    /// Heartbeat cadence (ms).
    pub heartbeat_interval_ms: u64,
    /// Peer expiry after silence (ms).
    pub inactivity_timeout_ms: u64,

    /// Retransmit window in packets.
    pub send_cache_depth: usize,

    /// ROI grid dimension G (grid is G x G).
    pub roi_grid_size: usize,
    /// Maximum per-cell QP adjustment.
    pub roi_max_qp_delta: u8,

    /// Outbound packet queue capacity.
    pub send_queue_cap: usize,
    /// Inbound event queue capacity.
    pub recv_queue_cap: usize,
    /// Completed-frame queue capacity on the receiver.
    pub frame_queue_cap: usize,

    /// Initial encoder bitrate (bps).
    pub start_bitrate: u64,
    /// Absolute encoder bitrate floor (bps).
    pub min_bitrate: u64,
    /// Absolute encoder bitrate ceiling (bps).
    pub max_bitrate: u64,
}

impl Default for CastorConfig {
    fn default() -> Self {
        CastorConfig {
            port: 8000,
            video_width: 1280,
            video_height: 720,
            target_fps: 30,
            min_payload: 500,
            max_payload: 1400,
            fec_block_size: 8,
            fec_overhead: 0.2,
            nack_interval_ms: 100,
            retransmit_timeout_ms: 300,
            reorder_window_frames: 30,
            max_presentation_delay_ms: 200,
            heartbeat_interval_ms: 1000,
            inactivity_timeout_ms: 10_000,
            send_cache_depth: 512,
            roi_grid_size: 8,
            roi_max_qp_delta: 10,
            send_queue_cap: 1000,
            recv_queue_cap: 1000,
            frame_queue_cap: 30,
            start_bitrate: 3_000_000,
            min_bitrate: 500_000,
            max_bitrate: 10_000_000,
        }
    }
}

impl CastorConfig {
    /// Parse a TOML document and validate the result.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: CastorConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.05..=0.5).contains(&self.fec_overhead) {
            return Err(ConfigError::FecOverhead(self.fec_overhead));
        }
        if self.fec_block_size < 2 {
            return Err(ConfigError::FecBlockSize(self.fec_block_size));
        }
        if self.min_payload > self.max_payload {
            return Err(ConfigError::PayloadBounds {
                min: self.min_payload,
                max: self.max_payload,
            });
        }
        if self.video_width == 0 || self.video_height == 0 {
            return Err(ConfigError::VideoDimensions(
                self.video_width,
                self.video_height,
            ));
        }
        if self.min_bitrate > self.max_bitrate {
            return Err(ConfigError::BitrateBounds {
                min: self.min_bitrate,
                max: self.max_bitrate,
            });
        }
        Ok(())
    }

    pub fn nack_interval(&self) -> Duration {
        Duration::from_millis(self.nack_interval_ms)
    }

    pub fn retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmit_timeout_ms)
    }

    pub fn max_presentation_delay(&self) -> Duration {
        Duration::from_millis(self.max_presentation_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    /// Parity packets emitted per full FEC block.
    pub fn fec_parity_count(&self) -> usize {
        ((self.fec_block_size as f64 * self.fec_overhead) as usize).max(1)
    }
}
