//! Mesh Coordination Protocol Definitions
//!
//! This crate defines the node descriptor, the connection handshake and the
//! length-framed codec spoken between the coordinator and its peers.

pub mod codec;
pub mod messages;
pub mod node;

pub use codec::{read_handshake, write_handshake, CodecError, FrameCodec};
pub use messages::{Handshake, NodeSet, PeerRole};
pub use node::{Node, PeerId};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
