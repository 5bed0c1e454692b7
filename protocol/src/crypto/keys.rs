//! # Participant Keys
//!
//! Ed25519 keypairs for participants. A participant's public key is
//! recorded on its [`ParticipantIdentity`](crate::identity::ParticipantIdentity)
//! at registration, and every pairing authentication proof is an Ed25519
//! signature that must verify against it.
//!
//! ## Security considerations
//!
//! - Private keys are zeroized on drop (ed25519-dalek does this for us).
//! - Keys are generated from `OsRng`.
//! - Key bytes are never logged. `Debug` prints the public half only.

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Errors that can occur while parsing key material.
///
/// Deliberately vague about why something failed.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key bytes")]
    InvalidSecretKey,

    #[error("invalid public key bytes: not a valid Ed25519 point")]
    InvalidPublicKey,

    #[error("invalid signature bytes: expected 64 bytes")]
    InvalidSignature,
}

/// A participant's signing keypair.
///
/// Does not implement `Serialize`; exporting secret material has to be an
/// explicit call to [`secret_key_bytes`](Self::secret_key_bytes).
///
/// # Examples
///
/// ```
/// use lct_protocol::crypto::ParticipantKeypair;
///
/// let kp = ParticipantKeypair::generate();
/// let sig = kp.sign(b"pair with module-7");
/// assert!(kp.public_key().verify(b"pair with module-7", &sig));
/// ```
pub struct ParticipantKeypair {
    signing_key: SigningKey,
}

/// The shareable half of a participant keypair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantPublicKey {
    bytes: [u8; 32],
}

/// A 64-byte Ed25519 signature.
///
/// Stored as `Vec<u8>` for serde; anything that isn't 64 bytes simply fails
/// verification.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSignature {
    bytes: Vec<u8>,
}

impl ParticipantKeypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed.
    ///
    /// Weak seed, weak key. Meant for tests and KDF-derived seeds.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Reconstruct a keypair from a hex-encoded secret key.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// The public key for this keypair.
    pub fn public_key(&self) -> ParticipantPublicKey {
        ParticipantPublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Sign `message`. Ed25519 signatures are deterministic.
    pub fn sign(&self, message: &[u8]) -> ParticipantSignature {
        ParticipantSignature {
            bytes: self.signing_key.sign(message).to_bytes().to_vec(),
        }
    }

    /// Raw secret key bytes. Handle with care.
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl Clone for ParticipantKeypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.signing_key.to_bytes())
    }
}

impl fmt::Debug for ParticipantKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParticipantKeypair(pub={})", self.public_key().to_hex())
    }
}

// ---------------------------------------------------------------------------
// ParticipantPublicKey
// ---------------------------------------------------------------------------

impl ParticipantPublicKey {
    /// Validate and wrap a 32-byte slice.
    ///
    /// Rejects byte strings that are not valid Ed25519 points.
    pub fn try_from_slice(slice: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes })
    }

    /// Parse a hex-encoded public key.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidPublicKey)?;
        Self::try_from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Verify `signature` over `message`. A plain yes/no; no error oracle.
    pub fn verify(&self, message: &[u8], signature: &ParticipantSignature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.bytes) else {
            return false;
        };
        let Some(sig) = signature.to_dalek_signature() else {
            return false;
        };
        verifying_key.verify(message, &sig).is_ok()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl Hash for ParticipantPublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl fmt::Display for ParticipantPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ParticipantPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParticipantPublicKey({})", &self.to_hex()[..16])
    }
}

// ---------------------------------------------------------------------------
// ParticipantSignature
// ---------------------------------------------------------------------------

impl ParticipantSignature {
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn to_dalek_signature(&self) -> Option<DalekSignature> {
        let arr: [u8; 64] = self.bytes.as_slice().try_into().ok()?;
        Some(DalekSignature::from_bytes(&arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidSignature)?;
        if bytes.len() != 64 {
            return Err(KeyError::InvalidSignature);
        }
        Ok(Self { bytes })
    }
}

impl fmt::Debug for ParticipantSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex_str = self.to_hex();
        if hex_str.len() >= 128 {
            write!(f, "ParticipantSignature({}...{})", &hex_str[..8], &hex_str[120..])
        } else {
            write!(f, "ParticipantSignature({})", hex_str)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_sign_verify_roundtrip() {
        let kp = ParticipantKeypair::generate();
        let sig = kp.sign(b"answer challenge");
        assert!(kp.public_key().verify(b"answer challenge", &sig));
    }

    #[test]
    fn wrong_message_fails_verification() {
        let kp = ParticipantKeypair::generate();
        let sig = kp.sign(b"correct message");
        assert!(!kp.public_key().verify(b"wrong message", &sig));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let kp1 = ParticipantKeypair::generate();
        let kp2 = ParticipantKeypair::generate();
        let sig = kp1.sign(b"message");
        assert!(!kp2.public_key().verify(b"message", &sig));
    }

    #[test]
    fn truncated_signature_fails_verification() {
        let kp = ParticipantKeypair::generate();
        let sig = kp.sign(b"message");
        let truncated = ParticipantSignature {
            bytes: sig.as_bytes()[..32].to_vec(),
        };
        assert!(!kp.public_key().verify(b"message", &truncated));
    }

    #[test]
    fn public_key_hex_roundtrip() {
        let pk = ParticipantKeypair::generate().public_key();
        let recovered = ParticipantPublicKey::from_hex(&pk.to_hex()).unwrap();
        assert_eq!(pk, recovered);
    }

    #[test]
    fn public_key_rejects_wrong_length() {
        assert!(ParticipantPublicKey::try_from_slice(&[0u8; 16]).is_err());
        assert!(ParticipantPublicKey::from_hex("zz").is_err());
    }

    #[test]
    fn secret_hex_roundtrip() {
        let kp = ParticipantKeypair::generate();
        let restored = ParticipantKeypair::from_hex(&hex::encode(kp.secret_key_bytes())).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());
        assert!(ParticipantKeypair::from_hex("deadbeef").is_err());
    }

    #[test]
    fn signature_hex_roundtrip() {
        let sig = ParticipantKeypair::generate().sign(b"test");
        assert_eq!(ParticipantSignature::from_hex(&sig.to_hex()).unwrap(), sig);
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let kp = ParticipantKeypair::generate();
        let secret_hex = hex::encode(kp.secret_key_bytes());
        let debug_str = format!("{:?}", kp);
        assert!(debug_str.starts_with("ParticipantKeypair(pub="));
        assert!(!debug_str.contains(&secret_hex));
    }

    #[test]
    fn deterministic_from_seed() {
        let seed = [42u8; 32];
        assert_eq!(
            ParticipantKeypair::from_seed(&seed).public_key(),
            ParticipantKeypair::from_seed(&seed).public_key()
        );
    }
}
