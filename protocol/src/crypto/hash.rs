//! # Hashing Utilities
//!
//! Two hash families, each with a clear job:
//!
//! - **SHA-2** — SHA-256 reconstructs session keys from the XOR of the two
//!   key halves, and SHA-512 stretches a challenge id into a full 64-byte
//!   master key on the degraded path. Interop-friendly, boring, correct.
//!
//! - **BLAKE3** — identifiers and fingerprints: tensor ids, trust anchors,
//!   key fingerprints. Always used through `derive_key` domain separation
//!   so that a tensor id can never collide with a key fingerprint even
//!   when the inputs happen to match.

use sha2::{Digest, Sha256, Sha512};

/// Compute the SHA-256 digest of `data` as a fixed-size array.
///
/// # Example
///
/// ```
/// use lct_protocol::crypto::sha256;
///
/// let hash = sha256(b"relationship");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// Compute the SHA-512 digest of several parts fed sequentially.
pub fn sha512_multi(parts: &[&[u8]]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    let result = hasher.finalize();
    let mut output = [0u8; 64];
    output.copy_from_slice(&result);
    output
}

/// Compute the BLAKE3 hash of the input data.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Domain-separated BLAKE3 over several parts.
///
/// Uses BLAKE3's `derive_key` mode with `context` as the context string.
/// Parts are length-prefixed so that `("ab", "c")` and `("a", "bc")` hash
/// differently.
pub fn domain_separated_hash(context: &str, parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Same as [`domain_separated_hash`], hex-encoded.
pub fn domain_separated_hex(context: &str, parts: &[&[u8]]) -> String {
    hex::encode(domain_separated_hash(context, parts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        let hash = sha256(b"");
        let expected =
            hex::decode("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
                .unwrap();
        assert_eq!(hash.to_vec(), expected);
    }

    #[test]
    fn test_sha512_multi_matches_concatenation() {
        let joined = sha512_multi(&[b"challenge-", b"42"]);
        let single = sha512_multi(&[b"challenge-42"]);
        assert_eq!(joined, single);
    }

    #[test]
    fn test_domain_separation() {
        let a = domain_separated_hash("context-a", &[b"same"]);
        let b = domain_separated_hash("context-b", &[b"same"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_domain_hash_is_length_prefixed() {
        let a = domain_separated_hash("ctx", &[b"ab", b"c"]);
        let b = domain_separated_hash("ctx", &[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_domain_hex_is_64_chars() {
        assert_eq!(domain_separated_hex("ctx", &[b"x"]).len(), 64);
    }

    #[test]
    fn blake3_deterministic() {
        assert_eq!(blake3_hash(b"lct"), blake3_hash(b"lct"));
        assert_ne!(blake3_hash(b"lct"), blake3_hash(b"tcl"));
    }
}
