//! # Hashing Utilities
//!
//! BLAKE3 everywhere. Each use gets its own `derive_key` context string so a
//! checksum can never be confused with a key-check value or a vault digest,
//! even over identical input bytes.
//!
//! Comparisons go through [`blake3::Hash`], whose `PartialEq` is constant
//! time. Don't compare raw digest arrays with `==`.

use crate::config::HASH_OUTPUT_LENGTH;

const SHARD_CHECKSUM_CONTEXT: &str = "trishard v1 shard checksum";
const KEY_CHECK_CONTEXT: &str = "trishard v1 envelope key check";
const RECORD_DIGEST_CONTEXT: &str = "trishard v1 vault record digest";
const CODE_CHECKSUM_CONTEXT: &str = "trishard v1 recovery code checksum";

fn derive(context: &str, data: &[u8]) -> [u8; HASH_OUTPUT_LENGTH] {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Plain BLAKE3 digest.
pub fn blake3_hash(data: &[u8]) -> [u8; HASH_OUTPUT_LENGTH] {
    *blake3::hash(data).as_bytes()
}

/// Integrity checksum of a plaintext shard, stored in its envelope.
pub fn shard_checksum(plaintext: &[u8]) -> [u8; HASH_OUTPUT_LENGTH] {
    derive(SHARD_CHECKSUM_CONTEXT, plaintext)
}

/// Value that proves knowledge of an envelope key without revealing it.
pub fn key_check(key: &[u8; 32]) -> [u8; HASH_OUTPUT_LENGTH] {
    derive(KEY_CHECK_CONTEXT, key)
}

/// Digest over a serialized vault record.
pub fn record_digest(bytes: &[u8]) -> [u8; HASH_OUTPUT_LENGTH] {
    derive(RECORD_DIGEST_CONTEXT, bytes)
}

/// Short checksum appended to recovery code payloads.
pub fn code_checksum(payload: &[u8]) -> [u8; HASH_OUTPUT_LENGTH] {
    derive(CODE_CHECKSUM_CONTEXT, payload)
}

/// Constant-time equality for 32-byte digests.
pub fn digest_eq(a: &[u8; HASH_OUTPUT_LENGTH], b: &[u8; HASH_OUTPUT_LENGTH]) -> bool {
    blake3::Hash::from(*a) == blake3::Hash::from(*b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contexts_are_separated() {
        let data = b"same input";
        assert_ne!(shard_checksum(data), record_digest(data));
        assert_ne!(shard_checksum(data), code_checksum(data));
        assert_ne!(shard_checksum(data), blake3_hash(data));
    }

    #[test]
    fn test_checksum_is_deterministic() {
        assert_eq!(shard_checksum(b"abc"), shard_checksum(b"abc"));
        assert_ne!(shard_checksum(b"abc"), shard_checksum(b"abd"));
    }

    #[test]
    fn test_digest_eq() {
        let a = blake3_hash(b"x");
        let mut b = a;
        assert!(digest_eq(&a, &b));
        b[31] ^= 1;
        assert!(!digest_eq(&a, &b));
    }
}
