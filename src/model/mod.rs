//! Data models for the relay protocol
//!
//! This module contains the wire codec, the structured control payloads, the
//! server-side session registry, and the receiver-side file reconstructor.

pub mod frame;
pub mod kind;
pub mod payload;
pub mod propagated;
pub mod session;
pub mod transfer;

pub use frame::{Frame, FrameDecoder, TaggedMedia};
pub use kind::MessageKind;
pub use session::{ControlSink, Registry, Session};
