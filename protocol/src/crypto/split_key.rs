//! # Split Keys
//!
//! Every completed pairing mints a 64-byte master key and immediately cuts
//! it in half. Participant A walks away with the first 32 bytes,
//! participant B with the last 32. Neither half alone says anything about
//! the other (the bytes are uniformly random), so neither participant can
//! impersonate the relationship on their own.
//!
//! When both halves are brought together the session key is
//! `SHA-256(half_a XOR half_b)`. XOR is commutative, so it doesn't matter
//! who holds which half when reconstructing.
//!
//! ## Degraded randomness
//!
//! If the OS RNG fails we fall back to `SHA-512(prefix || challenge_id)`.
//! That key is only as secret as the challenge id, which is to say not
//! very. The fallback exists so a pairing on a broken host still produces
//! a usable (if weak) relationship instead of panicking; it logs loudly and
//! marks the [`MasterKey`] as degraded so callers can refuse it.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::{
    DEGRADED_KEY_PREFIX, DOMAIN_KEY_FINGERPRINT, DOMAIN_KEY_HALF_REFERENCE, KEY_HALF_LENGTH,
    MASTER_KEY_LENGTH, SESSION_KEY_LENGTH,
};
use crate::crypto::hash::{domain_separated_hash, domain_separated_hex, sha256, sha512_multi};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SplitKeyError {
    #[error("key halves do not correspond to this relationship")]
    KeyReconstructionMismatch,

    #[error("invalid key half: expected {KEY_HALF_LENGTH} bytes")]
    InvalidHalfLength,
}

/// Where the master key bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// Drawn from the OS CSPRNG. The normal path.
    SecureRandom,
    /// Derived from the challenge id because the RNG failed.
    DegradedDeterministic,
}

/// The full 64-byte key. Lives only long enough to be split.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; MASTER_KEY_LENGTH],
    #[zeroize(skip)]
    source: KeySource,
}

/// One participant's half of a master key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyHalf {
    bytes: [u8; KEY_HALF_LENGTH],
}

/// `SHA-256(half_a XOR half_b)`. The secret both sides derive channel keys from.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    bytes: [u8; SESSION_KEY_LENGTH],
}

impl MasterKey {
    /// Generate a master key for `challenge_id`.
    ///
    /// Uses the OS RNG. Only if that fails does it fall back to the
    /// deterministic derivation, with a `warn!` so it shows up in logs.
    pub fn generate(challenge_id: &str) -> Self {
        let mut bytes = [0u8; MASTER_KEY_LENGTH];
        match OsRng.try_fill_bytes(&mut bytes) {
            Ok(()) => Self {
                bytes,
                source: KeySource::SecureRandom,
            },
            Err(err) => {
                tracing::warn!(
                    challenge_id,
                    error = %err,
                    "secure randomness unavailable, deriving degraded-security master key"
                );
                Self::degraded(challenge_id)
            }
        }
    }

    /// The deterministic fallback. Public so it can be tested, never the default.
    pub fn degraded(challenge_id: &str) -> Self {
        Self {
            bytes: sha512_multi(&[DEGRADED_KEY_PREFIX, challenge_id.as_bytes()]),
            source: KeySource::DegradedDeterministic,
        }
    }

    pub fn source(&self) -> KeySource {
        self.source
    }

    /// Cut the key into `(half_a, half_b)`. Consumes the master key.
    pub fn split(self) -> (KeyHalf, KeyHalf) {
        let mut a = [0u8; KEY_HALF_LENGTH];
        let mut b = [0u8; KEY_HALF_LENGTH];
        a.copy_from_slice(&self.bytes[..KEY_HALF_LENGTH]);
        b.copy_from_slice(&self.bytes[KEY_HALF_LENGTH..]);
        (KeyHalf { bytes: a }, KeyHalf { bytes: b })
    }
}

impl KeyHalf {
    pub fn from_bytes(bytes: [u8; KEY_HALF_LENGTH]) -> Self {
        Self { bytes }
    }

    pub fn try_from_slice(slice: &[u8]) -> Result<Self, SplitKeyError> {
        let bytes: [u8; KEY_HALF_LENGTH] = slice
            .try_into()
            .map_err(|_| SplitKeyError::InvalidHalfLength)?;
        Ok(Self { bytes })
    }

    pub fn from_hex(s: &str) -> Result<Self, SplitKeyError> {
        let bytes = hex::decode(s).map_err(|_| SplitKeyError::InvalidHalfLength)?;
        Self::try_from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_HALF_LENGTH] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Public reference to this half, safe to store on a relationship token.
    pub fn reference(&self) -> String {
        domain_separated_hex(DOMAIN_KEY_HALF_REFERENCE, &[&self.bytes])
    }
}

impl std::fmt::Debug for KeyHalf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyHalf(ref={})", &self.reference()[..16])
    }
}

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LENGTH] {
        &self.bytes
    }

    /// BLAKE3 fingerprint, hex. What relationships store instead of the key.
    pub fn fingerprint(&self) -> String {
        hex::encode(domain_separated_hash(DOMAIN_KEY_FINGERPRINT, &[&self.bytes]))
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey(fp={})", &self.fingerprint()[..16])
    }
}

/// Rebuild the session key from both halves. Pure and commutative.
pub fn reconstruct(first: &KeyHalf, second: &KeyHalf) -> SessionKey {
    let mut mixed = [0u8; KEY_HALF_LENGTH];
    for (out, (x, y)) in mixed
        .iter_mut()
        .zip(first.bytes.iter().zip(second.bytes.iter()))
    {
        *out = x ^ y;
    }
    let key = SessionKey {
        bytes: sha256(&mixed),
    };
    mixed.zeroize();
    key
}

/// Reconstruct and check against a stored fingerprint.
///
/// Fails with [`SplitKeyError::KeyReconstructionMismatch`] when the halves
/// come from different pairings (or one was tampered with).
pub fn reconstruct_verified(
    first: &KeyHalf,
    second: &KeyHalf,
    expected_fingerprint: &str,
) -> Result<SessionKey, SplitKeyError> {
    let key = reconstruct(first, second);
    if key.fingerprint() != expected_fingerprint {
        return Err(SplitKeyError::KeyReconstructionMismatch);
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_produces_two_distinct_halves() {
        let master = MasterKey::generate("challenge-1");
        assert_eq!(master.source(), KeySource::SecureRandom);
        let (a, b) = master.split();
        assert_ne!(a, b);
        assert_eq!(a.as_bytes().len(), 32);
    }

    #[test]
    fn test_reconstruct_is_commutative() {
        let (a, b) = MasterKey::generate("challenge-2").split();
        assert_eq!(reconstruct(&a, &b), reconstruct(&b, &a));
    }

    #[test]
    fn test_reconstruct_is_xor_then_sha256() {
        let a = KeyHalf::from_bytes([0x0f; 32]);
        let b = KeyHalf::from_bytes([0xf0; 32]);
        let key = reconstruct(&a, &b);
        assert_eq!(key.as_bytes(), &sha256(&[0xff; 32]));
    }

    #[test]
    fn test_degraded_key_is_deterministic() {
        let k1 = MasterKey::degraded("challenge-3");
        let k2 = MasterKey::degraded("challenge-3");
        assert_eq!(k1.source(), KeySource::DegradedDeterministic);
        let (a1, b1) = k1.split();
        let (a2, b2) = k2.split();
        assert_eq!(a1, a2);
        assert_eq!(b1, b2);

        let (a3, _) = MasterKey::degraded("challenge-4").split();
        assert_ne!(a1, a3);
    }

    #[test]
    fn test_verified_reconstruction_detects_foreign_half() {
        let (a, b) = MasterKey::generate("one").split();
        let (_, foreign_b) = MasterKey::generate("two").split();
        let fingerprint = reconstruct(&a, &b).fingerprint();

        assert!(reconstruct_verified(&b, &a, &fingerprint).is_ok());
        assert_eq!(
            reconstruct_verified(&a, &foreign_b, &fingerprint).unwrap_err(),
            SplitKeyError::KeyReconstructionMismatch
        );
    }

    #[test]
    fn test_half_hex_roundtrip() {
        let (a, _) = MasterKey::generate("hex").split();
        assert_eq!(KeyHalf::from_hex(&a.to_hex()).unwrap(), a);
        assert_eq!(
            KeyHalf::from_hex("abcd").unwrap_err(),
            SplitKeyError::InvalidHalfLength
        );
    }

    #[test]
    fn debug_does_not_print_key_bytes() {
        let (a, b) = MasterKey::generate("debug").split();
        let key = reconstruct(&a, &b);
        assert!(!format!("{:?}", a).contains(&a.to_hex()));
        assert!(!format!("{:?}", key).contains(&hex::encode(key.as_bytes())));
    }
}
