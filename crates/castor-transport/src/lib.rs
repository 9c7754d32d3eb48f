//! # castor-transport
//!
//! Castor's adaptive weak-network video transport.
//!
//! A custom UDP datagram protocol that fragments encoded video frames,
//! protects them with XOR forward error correction, requests selective
//! retransmission via NACKs, and continuously measures link conditions for
//! the encoder controller. The design prefers timeliness over completeness:
//! a frame that cannot be completed in time is dropped, never waited for.
//!
//! ## Crate structure
//!
//! - [`wire`] — fixed-header packet codec, typed control/heartbeat bodies
//! - [`fragment`] — frame fragmentation and reassembly
//! - [`fec`] — XOR parity blocks with per-source length recovery
//! - [`monitor`] — per-peer RTT/loss/bandwidth model, classifier, predictor
//! - [`arq`] — receiver gap tracking and NACK batching
//! - [`pool`] — send cache, sequence generator, wire timestamp clock
//! - [`queue`] — bounded queues with keyframe-preserving overflow policy
//! - [`pacer`] — leaky-bucket send pacing
//! - [`session`] — heartbeat-driven peer lifecycle
//! - [`stats`] — transport counters and smoothing helpers
//! - [`sender`] — server-side transport orchestration
//! - [`receiver`] — client-side transport orchestration

pub mod arq;
pub mod fec;
pub mod fragment;
pub mod monitor;
pub mod pacer;
pub mod pool;
pub mod queue;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod stats;
pub mod wire;

pub use receiver::{CompressedFrame, ReceiverConfig, TransportReceiver};
pub use sender::{SenderConfig, TransportSender};
