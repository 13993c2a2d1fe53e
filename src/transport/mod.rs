//! Framed TCP transport shared by mirror forwarding and raw resync.

pub mod cbor;
pub mod frame;
pub mod listener;

pub use cbor::{DecodeLimits, PacketDecodeError, PacketEncodeError};
pub use frame::{Frame, FrameError, FrameReader, FrameWriter, encode_frame};
pub use listener::{ConnectionHandler, ListenerConfig, ListenerError, ListenerHandle, spawn_listener};

/// Default ceiling for a single frame body.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
