//! # Adaptive Encoder Controller
//!
//! Runs at ~1 Hz on the server. Each step reads a [`NetworkSnapshot`], picks
//! a quality tier from the RTT/loss thresholds, budgets bitrate against the
//! measured bandwidth (never moving more than ±50% per step), and drives the
//! codec collaborator: reconfigure on parameter changes, full reinit plus
//! forced keyframe on geometry/fps changes, forced keyframe after sustained
//! heavy loss.
//!
//! A rejected reconfiguration falls back to the previous parameters; the
//! stream degrades, it does not stop.

use std::fmt;
use std::time::Duration;

use quanta::Instant;
use tracing::{debug, info, warn};

use castor_common::{CastorConfig, EncoderParams, NetworkSnapshot};

use crate::encoder::VideoEncoder;
use crate::roi::{QpDeltaGrid, RoiGrid};

/// Loss ratio above which a sustained spell forces a keyframe.
const LOSS_KEYFRAME_THRESHOLD: f64 = 0.10;

/// How long loss must stay above the threshold before the forced keyframe.
const LOSS_KEYFRAME_SUSTAIN: Duration = Duration::from_secs(1);

/// Maximum relative bitrate move per step.
const BITRATE_STEP_LIMIT: f64 = 0.5;

/// Share of the measured available bandwidth the encoder may claim.
const BANDWIDTH_MARGIN: f64 = 0.8;

// ─── Tiers ──────────────────────────────────────────────────────────────────

/// Quality tiers, best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderTier {
    High,
    Balanced,
    Low,
    Emergency,
}

impl EncoderTier {
    /// Threshold selection on the measured link.
    pub fn for_conditions(rtt_ms: f64, loss: f64) -> Self {
        if rtt_ms < 100.0 && loss < 0.02 {
            EncoderTier::High
        } else if rtt_ms < 200.0 && loss < 0.05 {
            EncoderTier::Balanced
        } else if rtt_ms < 300.0 && loss < 0.10 {
            EncoderTier::Low
        } else {
            EncoderTier::Emergency
        }
    }

    fn scale(self) -> f64 {
        match self {
            EncoderTier::High => 1.0,
            EncoderTier::Balanced => 0.75,
            EncoderTier::Low => 0.5,
            EncoderTier::Emergency => 0.35,
        }
    }

    fn fps_cap(self) -> u32 {
        match self {
            EncoderTier::High => u32::MAX,
            EncoderTier::Balanced => 30,
            EncoderTier::Low => 20,
            EncoderTier::Emergency => 10,
        }
    }

    fn base_qp(self) -> u8 {
        match self {
            EncoderTier::High => 23,
            EncoderTier::Balanced => 26,
            EncoderTier::Low => 29,
            EncoderTier::Emergency => 32,
        }
    }

    fn gop(self) -> u32 {
        match self {
            EncoderTier::High | EncoderTier::Balanced => 30,
            EncoderTier::Low => 20,
            EncoderTier::Emergency => 10,
        }
    }

    fn params(self, config: &ControllerConfig, bitrate: u64) -> EncoderParams {
        EncoderParams {
            width: scaled_dimension(config.native_width, self.scale()),
            height: scaled_dimension(config.native_height, self.scale()),
            fps: config.target_fps.min(self.fps_cap()),
            bitrate,
            gop: self.gop(),
            base_qp: self.base_qp(),
        }
    }
}

impl fmt::Display for EncoderTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EncoderTier::High => "high",
            EncoderTier::Balanced => "balanced",
            EncoderTier::Low => "low",
            EncoderTier::Emergency => "emergency",
        };
        f.write_str(name)
    }
}

/// Codecs want even dimensions.
fn scaled_dimension(native: u32, scale: f64) -> u32 {
    (((native as f64 * scale) as u32).max(2)) & !1
}

// ─── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub native_width: u32,
    pub native_height: u32,
    pub target_fps: u32,
    pub start_bitrate: u64,
    pub min_bitrate: u64,
    pub max_bitrate: u64,
    pub roi_max_qp_delta: u8,
}

impl From<&CastorConfig> for ControllerConfig {
    fn from(cfg: &CastorConfig) -> Self {
        ControllerConfig {
            native_width: cfg.video_width,
            native_height: cfg.video_height,
            target_fps: cfg.target_fps,
            start_bitrate: cfg.start_bitrate,
            min_bitrate: cfg.min_bitrate,
            max_bitrate: cfg.max_bitrate,
            roi_max_qp_delta: cfg.roi_max_qp_delta,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig::from(&CastorConfig::default())
    }
}

// ─── Controller ─────────────────────────────────────────────────────────────

/// Outcome of one controller step.
#[derive(Debug, Clone, Copy)]
pub struct ControlDecision {
    /// Parameters now in force.
    pub params: EncoderParams,
    pub tier: EncoderTier,
    /// The encoder was torn down and rebuilt (geometry or fps change).
    pub reinitialized: bool,
    /// A keyframe was requested this step.
    pub forced_keyframe: bool,
}

/// Network-driven encoder parameter controller.
pub struct AdaptiveController {
    config: ControllerConfig,
    current: EncoderParams,
    tier: EncoderTier,
    loss_high_since: Option<Instant>,
    reconfigure_failures: u64,
    qp_degraded_logged: bool,
}

impl AdaptiveController {
    pub fn new(config: ControllerConfig) -> Self {
        let tier = EncoderTier::High;
        let current = tier.params(&config, config.start_bitrate);
        AdaptiveController {
            config,
            current,
            tier,
            loss_high_since: None,
            reconfigure_failures: 0,
            qp_degraded_logged: false,
        }
    }

    /// One adaptation step against the current link measurements.
    pub fn step(
        &mut self,
        snapshot: &NetworkSnapshot,
        encoder: &mut dyn VideoEncoder,
    ) -> ControlDecision {
        self.step_at(snapshot, encoder, Instant::now())
    }

    pub fn step_at(
        &mut self,
        snapshot: &NetworkSnapshot,
        encoder: &mut dyn VideoEncoder,
        now: Instant,
    ) -> ControlDecision {
        let bitrate = self.target_bitrate(snapshot);
        let tier = EncoderTier::for_conditions(snapshot.rtt_ms, snapshot.loss_ratio);
        let next = tier.params(&self.config, bitrate);
        let needs_reinit = self.current.needs_reinit(&next);

        let mut reinitialized = false;
        let mut forced_keyframe = false;

        if next != self.current {
            match encoder.reconfigure(&next) {
                Ok(()) => {
                    if needs_reinit {
                        info!(
                            %tier,
                            width = next.width,
                            height = next.height,
                            fps = next.fps,
                            bitrate = next.bitrate,
                            "encoder reinitialized"
                        );
                        reinitialized = true;
                        forced_keyframe = true;
                    } else {
                        debug!(bitrate = next.bitrate, "encoder bitrate updated");
                    }
                    self.current = next;
                    self.tier = tier;
                }
                Err(err) => {
                    // Keep streaming with the previous parameters.
                    self.reconfigure_failures += 1;
                    if self.reconfigure_failures == 1 {
                        warn!(error = %err, "encoder rejected reconfiguration, keeping previous tier");
                    }
                }
            }
        }

        if snapshot.loss_ratio > LOSS_KEYFRAME_THRESHOLD {
            match self.loss_high_since {
                None => self.loss_high_since = Some(now),
                Some(since) if now.duration_since(since) >= LOSS_KEYFRAME_SUSTAIN => {
                    debug!(loss = snapshot.loss_ratio, "sustained loss, forcing keyframe");
                    forced_keyframe = true;
                    // Re-arm: another keyframe only after another full spell.
                    self.loss_high_since = Some(now);
                }
                Some(_) => {}
            }
        } else {
            self.loss_high_since = None;
        }

        if forced_keyframe {
            encoder.request_keyframe();
        }

        ControlDecision {
            params: self.current,
            tier: self.tier,
            reinitialized,
            forced_keyframe,
        }
    }

    /// Translate an importance grid into QP deltas, unless the codec cannot
    /// take them (logged once, then silently degraded).
    pub fn qp_deltas(&mut self, grid: &RoiGrid, encoder: &dyn VideoEncoder) -> Option<QpDeltaGrid> {
        if !encoder.supports_qp_deltas() {
            if !self.qp_degraded_logged {
                warn!("codec has no per-block QP support, dropping ROI hints");
                self.qp_degraded_logged = true;
            }
            return None;
        }
        Some(grid.to_qp_deltas(self.config.roi_max_qp_delta))
    }

    pub fn params(&self) -> EncoderParams {
        self.current
    }

    pub fn tier(&self) -> EncoderTier {
        self.tier
    }

    pub fn reconfigure_failures(&self) -> u64 {
        self.reconfigure_failures
    }

    /// Bitrate budget: 80% of loss-adjusted bandwidth, moved at most ±50%
    /// from the current rate, inside the absolute bounds. With no bandwidth
    /// measurement yet the current rate stands.
    fn target_bitrate(&self, snapshot: &NetworkSnapshot) -> u64 {
        if snapshot.bandwidth_bps <= 0.0 {
            return self.current.bitrate;
        }
        let available = snapshot.bandwidth_bps * (1.0 - snapshot.loss_ratio);
        let target = BANDWIDTH_MARGIN * available;
        let floor = self.current.bitrate as f64 * (1.0 - BITRATE_STEP_LIMIT);
        let ceiling = self.current.bitrate as f64 * (1.0 + BITRATE_STEP_LIMIT);
        (target.clamp(floor, ceiling) as u64)
            .clamp(self.config.min_bitrate, self.config.max_bitrate)
    }
}
