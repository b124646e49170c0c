//! meshlink-node: sessions, handshake, reassembly and retransmission over
//! a datagram transport.

pub mod adapter;
pub mod error;
mod handshake;
pub mod node;
pub mod receive;
pub mod receiver;
pub mod session;
pub mod sweeper;
pub mod transport;

#[cfg(test)]
mod test_util;

pub use adapter::Adapter;
pub use error::{ProtocolError, SendError};
pub use node::{Node, NodeSettings, Peer, TestMode};
pub use receiver::{Inbound, PayloadReceiver};
pub use session::{Phase, SessionSnapshot};
pub use transport::Transport;
