//! Codec collaborator contract.
//!
//! The real encoder lives outside this crate (hardware, x264, whatever the
//! deployment provides). The controller only needs three capabilities:
//! reconfigure, encode with an optional QP-delta grid, and keyframe on
//! demand.

use bytes::Bytes;
use thiserror::Error;

use castor_common::EncoderParams;

use crate::roi::QpDeltaGrid;

/// Codec-side failures.
#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("encoder rejected parameters: {0}")]
    Reconfigure(String),
    #[error("encode failed: {0}")]
    Encode(String),
}

/// One captured frame as an 8-bit luma plane, row-major, `width * height`
/// bytes. The ROI detector and QP hinting operate on luma only; chroma never
/// leaves the capture/codec boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RawFrame {
    /// A black frame.
    pub fn new(width: u32, height: u32) -> Self {
        RawFrame {
            width,
            height,
            data: vec![0; (width * height) as usize],
        }
    }

    pub fn luma(&self, x: u32, y: u32) -> u8 {
        self.data[(y * self.width + x) as usize]
    }

    pub fn set_luma(&mut self, x: u32, y: u32, value: u8) {
        self.data[(y * self.width + x) as usize] = value;
    }
}

/// Output of one encode call.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub is_keyframe: bool,
}

/// The external codec contract.
pub trait VideoEncoder {
    /// Apply new parameters. A resolution or fps change implies a full
    /// encoder reinit on the codec side; bitrate and QP changes do not.
    fn reconfigure(&mut self, params: &EncoderParams) -> Result<(), EncoderError>;

    /// Encode one frame. `qp_deltas` is advisory; codecs without per-block
    /// QP support receive `None`.
    fn encode(
        &mut self,
        frame: &RawFrame,
        qp_deltas: Option<&QpDeltaGrid>,
    ) -> Result<EncodedFrame, EncoderError>;

    /// Force the next encoded frame to be a keyframe.
    fn request_keyframe(&mut self);

    /// Whether the codec accepts per-block QP deltas.
    fn supports_qp_deltas(&self) -> bool {
        true
    }
}
