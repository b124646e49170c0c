//! Payload envelopes carried inside blocks.
//!
//! Control and data payloads are serde structs serialized with bincode.
//! Ack and Nack carry only a block id as four big-endian bytes.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::wire::BlockId;

/// `{data, signature}`: KeyRequest and SessionKey payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

/// `{data}`: Data payloads, `data` being the symmetric ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEnvelope {
    pub data: Vec<u8>,
}

/// Signed body of a KeyRequest: the requester's nonce, then the nonce it
/// received in Welcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRequestBody {
    pub sender_nonce: Vec<u8>,
    pub receiver_nonce: Vec<u8>,
}

/// Plaintext sealed to the requester in a SessionKey: the raw symmetric key
/// and the requester's own nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeyBody {
    pub session_key: Vec<u8>,
    pub receiver_nonce: Vec<u8>,
}

pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, EnvelopeError> {
    Ok(bincode::serialize(value)?)
}

pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EnvelopeError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Ack/Nack payload.
pub fn encode_block_ref(block_id: BlockId) -> [u8; 4] {
    block_id.to_be_bytes()
}

pub fn decode_block_ref(bytes: &[u8]) -> Result<BlockId, EnvelopeError> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| EnvelopeError::BadBlockRef(bytes.len()))?;
    Ok(BlockId::from_be_bytes(raw))
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope encoding: {0}")]
    Codec(#[from] bincode::Error),

    #[error("block reference must be 4 bytes, got {0}")]
    BadBlockRef(usize),
}
