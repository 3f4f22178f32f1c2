//! LEDBAT (RFC 6817) delay-based congestion control.
//!
//! The controller keeps queuing delay near a fixed target and backs off before loss-based
//! flows sharing the bottleneck notice anything.

pub mod delay;
pub mod loss;
pub mod rto;
pub mod window;

pub use delay::DelayHistory;
pub use loss::LossController;
pub use rto::RttEstimator;
pub use window::{CongestionWindow, WindowStats};

/// Identifier of one datum on a channel. Acks refer back to it.
pub type MsgId = u64;
