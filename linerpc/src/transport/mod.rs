//! Defines the transport layer: newline-framed messages over a byte stream.
//!
//! TCP is the only stream the library opens itself, but everything here works over any
//! `AsyncRead + AsyncWrite` pair, which is how the tests simulate a client and server talking
//! over a network.

mod connection;
mod frame;

pub use connection::{Connection, FrameReader, FrameSink, FrameWriter};
pub use frame::{FrameCodec, FrameError, DEFAULT_MAX_FRAME_LENGTH};
