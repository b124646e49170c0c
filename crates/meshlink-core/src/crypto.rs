//! Cryptographic primitives for meshlink.
//!
//! Provides three things:
//!   1. Long-term node identity: Ed25519 for signatures, X25519 for sealing
//!      data to a node's public key
//!   2. Session keys: ChaCha20-Poly1305 with a random 96-bit nonce per message
//!   3. Handshake nonces: 64 random bytes
//!
//! Sealing to a public key uses an ephemeral X25519 exchange whose shared
//! secret is turned into a one-shot ChaCha20-Poly1305 key with BLAKE3
//! `derive_key`.
//!
//! All secret key material is zeroized when dropped.
//! There is no unsafe code in this module.

use std::path::Path;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signer, Verifier};
use rand::RngCore;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Handshake nonce length in bytes.
pub const NONCE_LEN: usize = 64;

pub type HandshakeNonce = [u8; NONCE_LEN];

/// Fresh random handshake nonce.
pub fn generate_nonce() -> HandshakeNonce {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

const SEAL_CONTEXT: &str = "meshlink 2024-06 sealed box v1";
const FINGERPRINT_CONTEXT: &str = "meshlink 2024-06 key fingerprint v1";
const AEAD_NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

// ── Identity ──────────────────────────────────────────────────────────────────

/// A node's long-term secret identity.
///
/// Persisted as 64 bytes: the Ed25519 seed followed by the X25519 secret.
pub struct Identity {
    signing: ed25519_dalek::SigningKey,
    sealing: StaticSecret,
    public: PublicIdentity,
}

impl Identity {
    pub const SECRET_LEN: usize = 64;

    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut seed[..]);
        let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
        let sealing = StaticSecret::random_from_rng(rand::thread_rng());
        Self::from_parts(signing, sealing)
    }

    /// Rebuild an identity from its stored secret bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != Self::SECRET_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: Self::SECRET_LEN,
                got: bytes.len(),
            });
        }
        let mut seed = Zeroizing::new([0u8; 32]);
        seed.copy_from_slice(&bytes[..32]);
        let mut x = Zeroizing::new([0u8; 32]);
        x.copy_from_slice(&bytes[32..]);
        let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
        let sealing = StaticSecret::from(*x);
        Ok(Self::from_parts(signing, sealing))
    }

    fn from_parts(signing: ed25519_dalek::SigningKey, sealing: StaticSecret) -> Self {
        let public = PublicIdentity {
            verifying: signing.verifying_key(),
            sealing: PublicKey::from(&sealing),
        };
        Self {
            signing,
            sealing,
            public,
        }
    }

    /// Secret bytes for persistent storage. Store with mode 0600.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 64]> {
        let mut out = Zeroizing::new([0u8; 64]);
        out[..32].copy_from_slice(&self.signing.to_bytes());
        out[32..].copy_from_slice(&self.sealing.to_bytes());
        out
    }

    pub fn public(&self) -> PublicIdentity {
        self.public
    }

    /// Ed25519 signature (64 bytes) over `message`.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    /// Open data sealed with [`PublicIdentity::encrypt`].
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < 32 + TAG_LEN {
            return Err(CryptoError::TooShort);
        }
        let mut eph = [0u8; 32];
        eph.copy_from_slice(&sealed[..32]);
        let eph = PublicKey::from(eph);
        let shared = self.sealing.diffie_hellman(&eph);
        let key = seal_key(shared.as_bytes(), eph.as_bytes(), self.public.sealing.as_bytes());
        ChaCha20Poly1305::new(Key::from_slice(&key[..]))
            .decrypt(Nonce::from_slice(&[0u8; AEAD_NONCE_LEN]), &sealed[32..])
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Load the identity at `path`, creating and storing a new one if absent.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let bytes = Zeroizing::new(std::fs::read(path)?);
            return Self::from_secret_bytes(&bytes);
        }

        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_secret(path, &identity.secret_bytes()[..])?;
        Ok(identity)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public", &self.public.to_hex())
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn write_secret(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)
}

#[cfg(not(unix))]
fn write_secret(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}

fn seal_key(shared: &[u8; 32], eph: &[u8; 32], recipient: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let mut material = Zeroizing::new([0u8; 96]);
    material[..32].copy_from_slice(shared);
    material[32..64].copy_from_slice(eph);
    material[64..].copy_from_slice(recipient);
    Zeroizing::new(blake3::derive_key(SEAL_CONTEXT, &material[..]))
}

// ── Public identity ───────────────────────────────────────────────────────────

/// The public half of an [`Identity`], as exchanged in Hello.
///
/// Wire form: 64 bytes, Ed25519 verifying key then X25519 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicIdentity {
    verifying: ed25519_dalek::VerifyingKey,
    sealing: PublicKey,
}

impl PublicIdentity {
    pub const LEN: usize = 64;

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(self.verifying.as_bytes());
        out[32..].copy_from_slice(self.sealing.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != Self::LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: Self::LEN,
                got: bytes.len(),
            });
        }
        let mut v = [0u8; 32];
        v.copy_from_slice(&bytes[..32]);
        let verifying =
            ed25519_dalek::VerifyingKey::from_bytes(&v).map_err(|_| CryptoError::InvalidPublicKey)?;
        let mut x = [0u8; 32];
        x.copy_from_slice(&bytes[32..]);
        Ok(Self {
            verifying,
            sealing: PublicKey::from(x),
        })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim()).map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }

    /// Check an Ed25519 signature made by the matching [`Identity`].
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let signature =
            ed25519_dalek::Signature::from_slice(signature).map_err(|_| CryptoError::BadSignature)?;
        self.verifying
            .verify(message, &signature)
            .map_err(|_| CryptoError::BadSignature)
    }

    /// Seal `plaintext` so only the holder of the matching identity can open it.
    ///
    /// Output: `ephemeral_public (32) ‖ ciphertext ‖ tag (16)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let eph = EphemeralSecret::random_from_rng(rand::thread_rng());
        let eph_public = PublicKey::from(&eph);
        let shared = eph.diffie_hellman(&self.sealing);
        let key = seal_key(shared.as_bytes(), eph_public.as_bytes(), self.sealing.as_bytes());
        // The key is single-use, so a fixed nonce is sound here.
        let ct = ChaCha20Poly1305::new(Key::from_slice(&key[..]))
            .encrypt(Nonce::from_slice(&[0u8; AEAD_NONCE_LEN]), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(32 + ct.len());
        out.extend_from_slice(eph_public.as_bytes());
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Short stable digest for logs and comparisons.
    pub fn fingerprint(&self) -> [u8; 32] {
        blake3::derive_key(FINGERPRINT_CONTEXT, &self.to_bytes())
    }
}

// ── Session key ───────────────────────────────────────────────────────────────

/// Symmetric session key shared by both ends of an established session.
#[derive(Clone)]
pub struct SymmetricKey(Zeroizing<[u8; 32]>);

impl SymmetricKey {
    pub const LEN: usize = 32;

    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut key[..]);
        Self(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != Self::LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: Self::LEN,
                got: bytes.len(),
            });
        }
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Output: `nonce (12) ‖ ciphertext ‖ tag (16)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; AEAD_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ct = ChaCha20Poly1305::new(Key::from_slice(&self.0[..]))
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(AEAD_NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < AEAD_NONCE_LEN + TAG_LEN {
            return Err(CryptoError::TooShort);
        }
        let (nonce, body) = ciphertext.split_at(AEAD_NONCE_LEN);
        ChaCha20Poly1305::new(Key::from_slice(&self.0[..]))
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Digest identifying this key without revealing it.
    pub fn fingerprint(&self) -> [u8; 32] {
        blake3::derive_key(FINGERPRINT_CONTEXT, &self.0[..])
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}

impl Eq for SymmetricKey {}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("signature verification failed")]
    BadSignature,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("ciphertext too short")]
    TooShort,

    #[error("identity file: {0}")]
    Io(#[from] std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
