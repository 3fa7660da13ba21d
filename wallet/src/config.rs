//! # Lifecycle Configuration & Constants
//!
//! Every magic number in Trishard lives here. Shard formats, KDF cost,
//! recovery limits and collaborator timeouts all hang off these values, so
//! changing one after wallets exist in the wild means a migration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Threshold Parameters
// ---------------------------------------------------------------------------

/// Shards required to reconstruct signing capability.
pub const SHARD_THRESHOLD: u8 = 2;

/// Total shards issued per wallet: device (A), server-assisted (B), backup (C).
pub const SHARD_COUNT: u8 = 3;

/// Length of the signing seed that gets split. Ed25519 seeds are 32 bytes.
pub const SIGNING_SEED_LENGTH: usize = 32;

/// Length of a wallet address body in bytes (rendered as `0x` + 40 hex chars).
pub const ADDRESS_LENGTH: usize = 20;

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// AES-256-GCM key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes. Twelve. Always twelve.
pub const AES_NONCE_LENGTH: usize = 12;

/// AES-256-GCM authentication tag length in bytes.
pub const AES_TAG_LENGTH: usize = 16;

/// Digest length for BLAKE3 checksums and key-check values.
pub const HASH_OUTPUT_LENGTH: usize = 32;

/// Salt length for passphrase-derived keys.
pub const KDF_SALT_LENGTH: usize = 32;

/// scrypt cost parameter (log2 N). N = 32768, tuned for phones and laptops.
pub const SCRYPT_LOG_N: u8 = 15;

/// scrypt block size.
pub const SCRYPT_R: u32 = 8;

/// scrypt parallelism.
pub const SCRYPT_P: u32 = 1;

/// Version byte written into every envelope and vault record. Bump on any
/// change to the AAD layout or the on-disk framing.
pub const ENVELOPE_FORMAT_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// Recovery Codes
// ---------------------------------------------------------------------------

/// Human-readable prefix for Bech32m recovery codes ("trishard shard code").
pub const RECOVERY_CODE_HRP: &str = "tsc";

/// Bytes of inner checksum appended to the recovery code payload.
pub const RECOVERY_CODE_CHECKSUM_LENGTH: usize = 4;

// ---------------------------------------------------------------------------
// Recovery Sessions
// ---------------------------------------------------------------------------

/// Failed submissions tolerated in one session before it is forced to `Failed`.
pub const DEFAULT_MAX_FAILED_SUBMISSIONS: u32 = 5;

/// How long a recovery session stays open before it expires.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Request timeout for the provisioning and reconstruction services.
pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection timeout for the same.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default port for the node's HTTP surface.
pub const DEFAULT_API_PORT: u16 = 9751;

/// Default port for the Prometheus endpoint.
pub const DEFAULT_METRICS_PORT: u16 = 9752;

// ---------------------------------------------------------------------------
// Runtime Configuration
// ---------------------------------------------------------------------------

/// scrypt parameters recorded alongside every passphrase-encrypted envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            log_n: SCRYPT_LOG_N,
            r: SCRYPT_R,
            p: SCRYPT_P,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests. Never ship these.
    pub fn insecure_fast() -> Self {
        Self {
            log_n: 4,
            r: 8,
            p: 1,
        }
    }
}

/// Tunables for the lifecycle manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Failed shard submissions allowed per recovery session.
    pub max_failed_submissions: u32,
    /// Recovery session lifetime.
    pub session_ttl: Duration,
    /// KDF cost for passphrase-protected device shards.
    pub kdf: KdfParams,
    /// Timeout applied to collaborator calls.
    pub service_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_failed_submissions: DEFAULT_MAX_FAILED_SUBMISSIONS,
            session_ttl: DEFAULT_SESSION_TTL,
            kdf: KdfParams::default(),
            service_timeout: DEFAULT_SERVICE_TIMEOUT,
        }
    }
}
