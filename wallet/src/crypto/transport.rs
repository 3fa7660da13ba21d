//! # Transport Sealing
//!
//! Shards never cross the wire in plaintext. For every request that returns
//! shard material (provisioning, backup reissue, server shard release) the
//! client generates an ephemeral X25519 keypair and sends the public half.
//! The collaborator answers with its own ephemeral public key and codec
//! envelopes encrypted under the derived transport key.
//!
//! ```text
//! transport_key = BLAKE3-derive-key(
//!     "trishard v1 shard transport key",
//!     shared_secret || min(pub_a, pub_b) || max(pub_a, pub_b))
//! ```
//!
//! The ephemeral secret is consumed on derivation, so a transport key can be
//! computed exactly once per request.
//!
//! Requests that carry shards *to* a collaborator (reconstruction) run the
//! same exchange against the collaborator's static [`TransportResponder`]
//! key instead of an ephemeral one.

use rand::rngs::OsRng;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::config::AES_KEY_LENGTH;

const TRANSPORT_KEY_CONTEXT: &str = "trishard v1 shard transport key";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport key already derived -- ephemeral secret consumed")]
    AlreadyConsumed,

    #[error("peer public key must be 32 bytes, got {0}")]
    InvalidPublicKey(usize),
}

/// Client half of a one-shot transport exchange.
pub struct TransportSession {
    secret: Option<EphemeralSecret>,
    public_key: PublicKey,
}

impl TransportSession {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&secret);
        Self {
            secret: Some(secret),
            public_key,
        }
    }

    /// Public key to send to the collaborator.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public_key.to_bytes()
    }

    /// Hex form, for JSON request bodies.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Derive the transport key from the collaborator's ephemeral public key.
    pub fn derive_key(
        &mut self,
        peer_public: &[u8],
    ) -> Result<Zeroizing<[u8; AES_KEY_LENGTH]>, TransportError> {
        let peer: [u8; 32] = peer_public
            .try_into()
            .map_err(|_| TransportError::InvalidPublicKey(peer_public.len()))?;
        let secret = self.secret.take().ok_or(TransportError::AlreadyConsumed)?;
        let shared: SharedSecret = secret.diffie_hellman(&PublicKey::from(peer));
        Ok(derive_transport_key(
            shared.as_bytes(),
            &self.public_key.to_bytes(),
            &peer,
        ))
    }
}

impl Default for TransportSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Collaborator side: answer a client's public key in one step.
///
/// Returns the responder's ephemeral public key (to send back) and the
/// transport key to seal the response with.
pub fn respond(
    client_public: &[u8],
) -> Result<([u8; 32], Zeroizing<[u8; AES_KEY_LENGTH]>), TransportError> {
    let mut session = TransportSession::new();
    let our_public = session.public_key_bytes();
    let key = session.derive_key(client_public)?;
    Ok((our_public, key))
}

/// Long-lived collaborator key that clients seal outbound shards to.
///
/// Used where the client must send shard material before the collaborator
/// has answered (reconstruction). The client fetches
/// [`TransportResponder::public_key_bytes`] once, then runs a normal
/// [`TransportSession`] against it.
pub struct TransportResponder {
    secret: StaticSecret,
    public_key: PublicKey,
}

impl TransportResponder {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&secret);
        Self { secret, public_key }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public_key.to_bytes()
    }

    /// Transport key for a request carrying `client_public`.
    pub fn derive_key(
        &self,
        client_public: &[u8],
    ) -> Result<Zeroizing<[u8; AES_KEY_LENGTH]>, TransportError> {
        let peer: [u8; 32] = client_public
            .try_into()
            .map_err(|_| TransportError::InvalidPublicKey(client_public.len()))?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        Ok(derive_transport_key(
            shared.as_bytes(),
            &self.public_key.to_bytes(),
            &peer,
        ))
    }
}

fn derive_transport_key(
    shared_secret: &[u8; 32],
    our_public: &[u8; 32],
    peer_public: &[u8; 32],
) -> Zeroizing<[u8; AES_KEY_LENGTH]> {
    let mut hasher = blake3::Hasher::new_derive_key(TRANSPORT_KEY_CONTEXT);
    hasher.update(shared_secret);

    // Canonical ordering so both sides hash the same bytes.
    let (first, second) = if our_public <= peer_public {
        (our_public, peer_public)
    } else {
        (peer_public, our_public)
    };
    hasher.update(first);
    hasher.update(second);

    let mut key = Zeroizing::new([0u8; AES_KEY_LENGTH]);
    hasher.finalize_xof().fill(&mut key[..]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_derive_same_key() {
        let mut client = TransportSession::new();
        let (server_public, server_key) = respond(&client.public_key_bytes()).unwrap();
        let client_key = client.derive_key(&server_public).unwrap();
        assert_eq!(*client_key, *server_key);
    }

    #[test]
    fn test_secret_is_single_use() {
        let mut client = TransportSession::new();
        let (server_public, _) = respond(&client.public_key_bytes()).unwrap();
        client.derive_key(&server_public).unwrap();
        assert!(matches!(
            client.derive_key(&server_public),
            Err(TransportError::AlreadyConsumed)
        ));
    }

    #[test]
    fn test_short_public_key_rejected() {
        assert!(matches!(
            respond(&[0u8; 16]),
            Err(TransportError::InvalidPublicKey(16))
        ));
    }

    #[test]
    fn test_static_responder_matches_client() {
        let responder = TransportResponder::generate();
        let mut client = TransportSession::new();
        let server_key = responder.derive_key(&client.public_key_bytes()).unwrap();
        let client_key = client.derive_key(&responder.public_key_bytes()).unwrap();
        assert_eq!(*client_key, *server_key);
    }

    #[test]
    fn test_sessions_are_unique() {
        let a = TransportSession::new();
        let b = TransportSession::new();
        assert_ne!(a.public_key_bytes(), b.public_key_bytes());
    }
}
