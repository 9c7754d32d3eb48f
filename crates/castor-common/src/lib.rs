//! # castor-common
//!
//! Shared types for the Castor screen-streaming stack: the runtime
//! configuration surface and the read-only snapshot/parameter types exchanged
//! between the transport and the encoder controller.
//!
//! Keeping these in a leaf crate lets `castor-encode` consume network
//! snapshots without depending on the transport itself.

pub mod config;
pub mod types;

pub use config::{CastorConfig, ConfigError};
pub use types::{EncoderParams, NetworkSnapshot, QualityClass};
