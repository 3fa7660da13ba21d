// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Trishard: Threshold Wallet Lifecycle Manager
//!
//! Client-side lifecycle of a custodial-assisted wallet whose signing seed
//! is split 2-of-3. One shard stays on the device, one behind the
//! provisioning service, one with the user as a printed recovery code. Any
//! two rebuild the wallet; no single party can.
//!
//! ## Architecture
//!
//! - **config**: Protocol constants and lifecycle tunables.
//! - **crypto**: AES-GCM, scrypt, BLAKE3, X25519 transport keys, Ed25519.
//! - **shard**: Shard types, the envelope/recovery-code codec, Shamir over GF(256).
//! - **storage**: sled-backed vault for the Device shard, wallet registry, audit log.
//! - **provisioning**: Provisioning Service contract, HTTP client, response handling.
//! - **backup**: Display-once backup presentation and acknowledgement.
//! - **recovery**: Recovery sessions and the reconstruction contract.
//! - **collaborator**: In-process implementations of both collaborator contracts.
//! - **session**: The facade the UI talks to.
//! - **error**: The public error taxonomy.
//!
//! ## Ground rules
//!
//! 1. Shard plaintext lives in [`shard::ShardSecret`] and nowhere else.
//! 2. A wrong credential and a damaged shard are different errors, always.
//! 3. Everything durable is in sled; staged recovery material is not.

pub mod backup;
pub mod collaborator;
pub mod config;
pub mod crypto;
pub mod error;
pub mod provisioning;
pub mod recovery;
pub mod session;
pub mod shard;
pub mod storage;

pub use error::{Remediation, WalletError, WalletResult};
pub use session::{BackupState, WalletSession, WalletState};
