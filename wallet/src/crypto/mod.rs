//! # Cryptographic Primitives
//!
//! Thin, type-safe wrappers around audited implementations:
//!
//! - **AES-256-GCM** for shard envelopes.
//! - **scrypt** for passphrase-derived envelope keys.
//! - **X25519 + BLAKE3 derive_key** for sealing shards in transit.
//! - **BLAKE3** for checksums, key-check values and record digests.
//! - **Ed25519** for the reference collaborator's wallet keys.
//!
//! Nothing in here logs. Key bytes never reach a `tracing` macro.

pub mod encryption;
pub mod hash;
pub mod kdf;
pub mod keys;
pub mod transport;

pub use encryption::{open, seal, EncryptionError};
pub use keys::{derive_address, normalize_address, WalletKeypair};
pub use transport::{TransportError, TransportResponder, TransportSession};
