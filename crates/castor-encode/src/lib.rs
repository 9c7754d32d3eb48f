//! # castor-encode
//!
//! Encoder-side adaptation for the Castor streaming stack.
//!
//! The actual codec is an external collaborator behind the [`VideoEncoder`]
//! trait; this crate decides *what* to ask of it:
//!
//! - [`controller`] — picks the {resolution, fps, bitrate, GOP, base QP}
//!   tier from network snapshots, triggers reinits and forced keyframes
//! - [`roi`] — per-frame importance grid from pointer, motion and edge cues,
//!   mapped to per-cell QP deltas
//! - [`encoder`] — the codec contract and raw-frame type

pub mod controller;
pub mod encoder;
pub mod roi;

pub use controller::{AdaptiveController, ControlDecision, ControllerConfig, EncoderTier};
pub use encoder::{EncodedFrame, EncoderError, RawFrame, VideoEncoder};
pub use roi::{QpDeltaGrid, RoiDetector, RoiGrid};
