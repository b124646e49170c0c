use meshlink_core::crypto::CryptoError;
use meshlink_core::envelope::EnvelopeError;
use meshlink_core::{BlockError, NodeId, PacketType};

/// Why an inbound block was discarded. Never surfaces to callers; the
/// receive loop logs it and moves on.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed {kind:?} payload: {reason}")]
    Malformed { kind: PacketType, reason: String },

    #[error("signature verification failed")]
    Verification,

    #[error("nonce mismatch")]
    NonceMismatch,

    #[error("no session for peer {0}")]
    UnknownSession(NodeId),

    #[error("public key of peer {0} is unknown")]
    NoPublicKey(NodeId),

    #[error("transport unavailable")]
    TransportUnavailable,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Send(#[from] SendError),
}

impl ProtocolError {
    pub(crate) fn malformed(kind: PacketType, reason: impl ToString) -> Self {
        ProtocolError::Malformed {
            kind,
            reason: reason.to_string(),
        }
    }
}

/// Failure turning a block into datagrams.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("session encryption failed: {0}")]
    Encryption(#[from] CryptoError),

    #[error("no session key to encrypt with")]
    NoSessionKey,

    #[error(transparent)]
    Fragmentation(#[from] BlockError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}
