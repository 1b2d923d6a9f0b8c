//! Wire protocol
//!
//! This module defines the frame layout, the stream codec, and the
//! dispatcher that answers inbound frames.

pub mod codec;
pub mod dispatcher;
pub mod frame;

pub use self::codec::FrameCodec;
pub use self::dispatcher::{CommandHandler, FrameDispatcher, ParameterDispatcher};
pub use self::frame::{Echo, Frame, FrameKind, Operation};
