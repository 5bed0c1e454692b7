//! # Cryptographic Primitives
//!
//! Everything that touches key material lives under this module. The
//! engines above it only ever see opaque types: key halves, session keys,
//! signatures, sealed buffers.
//!
//! - **Ed25519** for participant authentication proofs.
//! - **Split keys**: 64 random bytes, halved, rebuilt with XOR + SHA-256.
//! - **PBKDF2-HMAC-SHA256 + AES-256-GCM** for the relationship channel.
//! - **BLAKE3** (domain separated) for ids, anchors and fingerprints.
//!
//! Nothing here is home-grown. These are thin wrappers around audited
//! RustCrypto and dalek implementations; keep it that way.

pub mod channel;
pub mod hash;
pub mod keys;
pub mod split_key;

pub use channel::{derive_channel_key, open, seal, ChannelError, ChannelKey, SecureChannel};
pub use hash::{blake3_hash, domain_separated_hash, domain_separated_hex, sha256};
pub use keys::{KeyError, ParticipantKeypair, ParticipantPublicKey, ParticipantSignature};
pub use split_key::{
    reconstruct, reconstruct_verified, KeyHalf, KeySource, MasterKey, SessionKey, SplitKeyError,
};
