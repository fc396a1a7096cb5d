//! Framed, multiplexed, flow-controlled transport.

mod connection;
pub mod frame;
mod framer;

pub use connection::{Connection, Incoming};
pub use frame::{Frame, FrameDecoder, FrameError, FrameTag};
pub use framer::{FrameReader, FrameWriter};
