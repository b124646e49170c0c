//! meshlink-core: wire format, block fragmentation, cryptographic primitives
//! and configuration. The stateful runtime lives in meshlink-node.

pub mod block;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod wire;

pub use block::{Block, BlockError};
pub use wire::{BlockId, NodeId, Packet, PacketType, WireError};
