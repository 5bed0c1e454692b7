//! # Encrypted Channel
//!
//! Confidential transport between the two sides of a relationship. Once
//! both key halves have been combined into a [`SessionKey`], each side runs
//! it through PBKDF2-HMAC-SHA256 (fixed salt, 100,000 iterations) to get an
//! AES-256-GCM key, and from there it's plain AEAD.
//!
//! ## Wire format
//!
//! [`seal`] returns `nonce || ciphertext || tag`: 12 bytes of random nonce
//! followed by the GCM output, which already has the 16-byte tag appended.
//! [`open`] expects exactly that.
//!
//! ## Nonce management
//!
//! GCM falls apart under nonce reuse. Every message gets a fresh 96-bit
//! nonce from the OS RNG, and [`SecureChannel`] remembers the last
//! [`CHANNEL_REPLAY_WINDOW`] nonces it has sealed or opened under its key
//! and refuses to see one of them twice. A repeated nonce is treated as a
//! hard error, never retried.
//!
//! The window keeps memory flat on long-lived channels. Replays older than
//! the window are not caught here; callers that need that carry their own
//! sequence numbers in the AAD. After [`CHANNEL_MESSAGE_LIMIT`] sealed
//! messages the channel refuses to seal more and the relationship has to
//! be paired again for a fresh key.
//!
//! ## Failure
//!
//! Decryption fails closed. Wrong key, flipped bit, wrong AAD, truncated
//! buffer: all of them are `AuthenticationFailed` and none of them return
//! a single byte of plaintext.

use std::collections::{HashSet, VecDeque};

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::{
    AES_KEY_LENGTH, AES_NONCE_LENGTH, AES_TAG_LENGTH, CHANNEL_KDF_ITERATIONS, CHANNEL_KDF_SALT,
    CHANNEL_MESSAGE_LIMIT, CHANNEL_REPLAY_WINDOW, MIN_KDF_ITERATIONS,
};
use crate::crypto::split_key::SessionKey;

/// Channel failures. Kept vague on purpose.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("encryption failed")]
    EncryptFailed,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("nonce already used under this channel key")]
    NonceReuse,

    #[error("kdf iteration count {0} is below the minimum of {MIN_KDF_ITERATIONS}")]
    WeakKdf(u32),

    #[error("channel key has sealed its message limit; pair again")]
    RekeyRequired,
}

/// AES-256 key derived from a session key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChannelKey {
    bytes: [u8; AES_KEY_LENGTH],
}

impl ChannelKey {
    /// Wrap raw key bytes. Mostly for tests and benches.
    pub fn from_bytes(bytes: [u8; AES_KEY_LENGTH]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; AES_KEY_LENGTH] {
        &self.bytes
    }
}

impl std::fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChannelKey(..)")
    }
}

/// Derive the channel key with the protocol iteration count.
pub fn derive_channel_key(session_key: &SessionKey) -> ChannelKey {
    let mut bytes = [0u8; AES_KEY_LENGTH];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        session_key.as_bytes(),
        CHANNEL_KDF_SALT,
        CHANNEL_KDF_ITERATIONS,
        &mut bytes,
    );
    ChannelKey { bytes }
}

/// Derive with a custom iteration count. Anything below the floor is refused.
pub fn derive_channel_key_with_iterations(
    session_key: &SessionKey,
    iterations: u32,
) -> Result<ChannelKey, ChannelError> {
    if iterations < MIN_KDF_ITERATIONS {
        return Err(ChannelError::WeakKdf(iterations));
    }
    let mut bytes = [0u8; AES_KEY_LENGTH];
    pbkdf2::pbkdf2_hmac::<Sha256>(session_key.as_bytes(), CHANNEL_KDF_SALT, iterations, &mut bytes);
    Ok(ChannelKey { bytes })
}

/// Seal `plaintext` under a fresh random nonce.
///
/// ```
/// use lct_protocol::crypto::channel::{open, seal, ChannelKey};
///
/// let key = ChannelKey::from_bytes([7u8; 32]);
/// let sealed = seal(&key, b"status: nominal", b"").unwrap();
/// assert_eq!(open(&key, &sealed, b"").unwrap(), b"status: nominal");
/// ```
pub fn seal(key: &ChannelKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, ChannelError> {
    let mut nonce = [0u8; AES_NONCE_LENGTH];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|_| ChannelError::EncryptFailed)?;
    seal_with_nonce(key, &nonce, plaintext, aad)
}

fn seal_with_nonce(
    key: &ChannelKey,
    nonce: &[u8; AES_NONCE_LENGTH],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, ChannelError> {
    let cipher =
        Aes256Gcm::new_from_slice(&key.bytes).map_err(|_| ChannelError::EncryptFailed)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| ChannelError::EncryptFailed)?;

    let mut out = Vec::with_capacity(AES_NONCE_LENGTH + ciphertext.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a buffer produced by [`seal`]. Fails closed.
pub fn open(key: &ChannelKey, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, ChannelError> {
    if sealed.len() < AES_NONCE_LENGTH + AES_TAG_LENGTH {
        return Err(ChannelError::AuthenticationFailed);
    }
    let (nonce, ciphertext) = sealed.split_at(AES_NONCE_LENGTH);
    let cipher =
        Aes256Gcm::new_from_slice(&key.bytes).map_err(|_| ChannelError::AuthenticationFailed)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| ChannelError::AuthenticationFailed)
}

// ---------------------------------------------------------------------------
// SecureChannel
// ---------------------------------------------------------------------------

/// Nonces seen recently, oldest evicted first.
#[derive(Debug, Default)]
struct ReplayWindow {
    order: VecDeque<[u8; AES_NONCE_LENGTH]>,
    seen: HashSet<[u8; AES_NONCE_LENGTH]>,
}

impl ReplayWindow {
    /// Record `nonce`. `false` if it is already in the window.
    fn insert(&mut self, nonce: [u8; AES_NONCE_LENGTH]) -> bool {
        if !self.seen.insert(nonce) {
            return false;
        }
        self.order.push_back(nonce);
        if self.order.len() > CHANNEL_REPLAY_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// One side of an encrypted relationship channel.
///
/// Tracks recent nonces under its key, in both directions. Replaying a
/// sealed message into `open` is refused the same way as reusing a nonce
/// in `seal`.
#[derive(Debug)]
pub struct SecureChannel {
    relationship_id: String,
    key: ChannelKey,
    window: ReplayWindow,
    sealed: u64,
    opened: u64,
}

impl SecureChannel {
    /// Build a channel from a reconstructed session key.
    pub fn new(relationship_id: impl Into<String>, session_key: &SessionKey) -> Self {
        Self::with_key(relationship_id, derive_channel_key(session_key))
    }

    pub fn with_key(relationship_id: impl Into<String>, key: ChannelKey) -> Self {
        Self {
            relationship_id: relationship_id.into(),
            key,
            window: ReplayWindow::default(),
            sealed: 0,
            opened: 0,
        }
    }

    pub fn relationship_id(&self) -> &str {
        &self.relationship_id
    }

    /// Messages sealed or opened so far.
    pub fn message_count(&self) -> u64 {
        self.sealed + self.opened
    }

    /// Nonces currently held for replay detection.
    pub fn tracked_nonces(&self) -> usize {
        self.window.len()
    }

    /// Encrypt a message for the other side.
    ///
    /// The relationship id is always bound in as AAD, in front of `aad`.
    pub fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let mut nonce = [0u8; AES_NONCE_LENGTH];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|_| ChannelError::EncryptFailed)?;
        self.seal_with_nonce(nonce, plaintext, aad)
    }

    fn seal_with_nonce(
        &mut self,
        nonce: [u8; AES_NONCE_LENGTH],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, ChannelError> {
        if self.sealed >= CHANNEL_MESSAGE_LIMIT {
            tracing::warn!(relationship_id = %self.relationship_id, "channel key exhausted");
            return Err(ChannelError::RekeyRequired);
        }
        if !self.window.insert(nonce) {
            tracing::error!(relationship_id = %self.relationship_id, "refusing to reuse channel nonce");
            return Err(ChannelError::NonceReuse);
        }
        let sealed = seal_with_nonce(&self.key, &nonce, plaintext, &self.bound_aad(aad))?;
        self.sealed += 1;
        Ok(sealed)
    }

    /// Decrypt a message from the other side.
    pub fn open(&mut self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let plaintext = open(&self.key, sealed, &self.bound_aad(aad))?;
        let mut nonce = [0u8; AES_NONCE_LENGTH];
        nonce.copy_from_slice(&sealed[..AES_NONCE_LENGTH]);
        if !self.window.insert(nonce) {
            tracing::warn!(relationship_id = %self.relationship_id, "replayed channel message rejected");
            return Err(ChannelError::NonceReuse);
        }
        self.opened += 1;
        Ok(plaintext)
    }

    fn bound_aad(&self, aad: &[u8]) -> Vec<u8> {
        let mut bound = Vec::with_capacity(self.relationship_id.len() + 1 + aad.len());
        bound.extend_from_slice(self.relationship_id.as_bytes());
        bound.push(0);
        bound.extend_from_slice(aad);
        bound
    }
}
