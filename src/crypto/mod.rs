//! Per-peer-pair key agreement and fingerprints
//!
//! One ephemeral X25519 key pair is generated for the whole session. Each
//! remote public key that arrives yields a pair-shared AES-256 chat key via
//! HKDF-SHA256, salted with the ordered id pair so both directions derive the
//! same bits. Fingerprints are computed from raw public keys only, so anyone
//! can recompute and compare them out of band.

pub mod chat;

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::rtc::types::PeerId;

pub use chat::{ChatError, SealedChat};

const KEY_INFO: &[u8] = b"callmesh chat v1";

/// 32-byte symmetric chat key derived for one peer pair.
#[derive(Clone, PartialEq, Eq)]
pub struct ChatKey([u8; 32]);

impl ChatKey {
    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for ChatKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChatKey(***)")
    }
}

/// Outcome of receiving a peer's public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    /// First key seen for this peer.
    New,
    /// Same key as before; derived material untouched.
    Unchanged,
    /// Different key than before: treated as a fresh identity, prior
    /// verification discarded.
    Rotated,
}

struct PeerKeyMaterial {
    public: [u8; 32],
    chat_key: ChatKey,
    fingerprint: String,
    verified: bool,
}

/// Session-wide key agreement state.
///
/// The private half never leaves this struct and is shared read-only across
/// all peers; derived chat keys are peer-exclusive.
pub struct KeyExchange {
    secret: StaticSecret,
    public: PublicKey,
    local_id: Option<PeerId>,
    peers: HashMap<PeerId, PeerKeyMaterial>,
}

impl KeyExchange {
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            local_id: None,
            peers: HashMap::new(),
        }
    }

    /// Records the relay-issued local id; pair keys cannot be derived before
    /// this is known.
    pub fn bind(&mut self, local_id: PeerId) {
        self.local_id = Some(local_id);
    }

    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// Local fingerprint, displayable before any peer is known.
    pub fn local_fingerprint(&self) -> String {
        fingerprint_of(self.public.as_bytes())
    }

    /// Handles a peer's announced public key, deriving the pair key.
    ///
    /// Idempotent for a repeated key; a changed key recomputes everything and
    /// clears the verified mark.
    pub fn receive(&mut self, peer: &PeerId, public_b64: &str) -> Result<KeyEvent> {
        let local = self
            .local_id
            .clone()
            .context("no local id assigned yet, cannot derive pair key")?;

        let raw = BASE64
            .decode(public_b64)
            .context("peer public key is not valid base64")?;
        let public: [u8; 32] = raw
            .try_into()
            .ok()
            .context("peer public key has wrong length")?;

        let event = match self.peers.get(peer) {
            Some(existing) if existing.public == public => return Ok(KeyEvent::Unchanged),
            Some(_) => KeyEvent::Rotated,
            None => KeyEvent::New,
        };

        let chat_key = derive_pair_key(&self.secret, &public, &local, peer);
        self.peers.insert(
            peer.clone(),
            PeerKeyMaterial {
                public,
                chat_key,
                fingerprint: fingerprint_of(&public),
                verified: false,
            },
        );
        Ok(event)
    }

    pub fn chat_key(&self, peer: &PeerId) -> Option<&ChatKey> {
        self.peers.get(peer).map(|m| &m.chat_key)
    }

    pub fn fingerprint(&self, peer: &PeerId) -> Option<&str> {
        self.peers.get(peer).map(|m| m.fingerprint.as_str())
    }

    /// Marks a peer as verified out of band. Returns false if no key material
    /// exists for the peer yet.
    pub fn mark_verified(&mut self, peer: &PeerId) -> bool {
        match self.peers.get_mut(peer) {
            Some(m) => {
                m.verified = true;
                true
            }
            None => false,
        }
    }

    pub fn is_verified(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).map(|m| m.verified).unwrap_or(false)
    }

    /// Drops all derived material for a departed peer.
    pub fn forget(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

fn derive_pair_key(
    secret: &StaticSecret,
    remote_public: &[u8; 32],
    local: &PeerId,
    remote: &PeerId,
) -> ChatKey {
    let shared = secret.diffie_hellman(&PublicKey::from(*remote_public));

    // Both sides must salt identically, so the pair ids are ordered first.
    let (lo, hi) = if local <= remote {
        (local, remote)
    } else {
        (remote, local)
    };
    let salt = format!("{}|{}", lo, hi);

    let hk = Hkdf::<Sha256>::new(Some(salt.as_bytes()), shared.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(KEY_INFO, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    ChatKey(okm)
}

/// Short fingerprint of a raw public key: SHA-256, first 8 bytes, grouped as
/// four hex digits per group.
pub fn fingerprint_of(public: &[u8]) -> String {
    let digest = Sha256::digest(public);
    digest[..8]
        .chunks(2)
        .map(hex::encode)
        .collect::<Vec<_>>()
        .join(" ")
}
