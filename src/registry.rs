//! Per-peer key slots and ratchet ownership.
//!
//! Each registered peer carries its current identity public key, an
//! optional previous key inside a short grace window, and the ratchet for
//! the channel. Ratchets are created lazily: registration before the local
//! session id is known parks the peer until `set_local_session_id` runs.

use crate::error::Error;
use crate::identity::Identity;
use crate::ratchet::DoubleRatchet;
use crate::types::X25519PublicKey;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// How long a superseded peer public key stays usable for decryption.
pub const PREVIOUS_KEY_GRACE: Duration = Duration::from_secs(30);

pub(crate) struct PeerEntry {
    pub(crate) public: X25519PublicKey,
    pub(crate) previous: Option<(X25519PublicKey, SystemTime)>,
    pub(crate) ratchet: Option<DoubleRatchet>,
}

/// Owns every per-peer channel for one local session.
#[derive(Default)]
pub struct HandshakeRegistry {
    local_id: Option<String>,
    peers: HashMap<String, PeerEntry>,
}

impl HandshakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    /// Sets the local session identity and initializes ratchets for any
    /// peers that were registered before it was known.
    pub fn set_local_session_id(&mut self, id: &str, identity: &Identity) -> Result<(), Error> {
        self.local_id = Some(id.to_string());

        for (peer_id, entry) in self.peers.iter_mut() {
            if entry.ratchet.is_none() {
                entry.ratchet = Some(DoubleRatchet::initialize(
                    id,
                    peer_id,
                    identity.secret(),
                    &entry.public,
                )?);
                tracing::debug!(peer = %peer_id, "initialized deferred ratchet");
            }
        }

        Ok(())
    }

    /// Registers a peer's identity key, creating the channel ratchet if
    /// the local session id is already known.
    pub fn register_peer(
        &mut self,
        peer_id: &str,
        public: X25519PublicKey,
        identity: &Identity,
    ) -> Result<(), Error> {
        let ratchet = match self.local_id.as_deref() {
            Some(local_id) => Some(DoubleRatchet::initialize(
                local_id,
                peer_id,
                identity.secret(),
                &public,
            )?),
            None => None,
        };

        self.peers.insert(
            peer_id.to_string(),
            PeerEntry {
                public,
                previous: None,
                ratchet,
            },
        );

        tracing::debug!(peer = %peer_id, "registered peer");
        Ok(())
    }

    /// Replaces a peer's identity key, keeping the old one decryptable for
    /// the grace window. The running ratchet is untouched: its chains no
    /// longer depend on the static keys that seeded them.
    pub fn update_peer_key(&mut self, peer_id: &str, new_public: X25519PublicKey) -> Result<(), Error> {
        self.update_peer_key_at(peer_id, new_public, SystemTime::now())
    }

    pub(crate) fn update_peer_key_at(
        &mut self,
        peer_id: &str,
        new_public: X25519PublicKey,
        now: SystemTime,
    ) -> Result<(), Error> {
        let entry = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| Error::Protocol(format!("unknown peer: {peer_id}")))?;

        let outgoing = std::mem::replace(&mut entry.public, new_public);
        entry.previous = Some((outgoing, now + PREVIOUS_KEY_GRACE));

        tracing::info!(peer = %peer_id, "peer identity key updated");
        Ok(())
    }

    pub fn peer_public(&self, peer_id: &str) -> Option<X25519PublicKey> {
        self.peers.get(peer_id).map(|entry| entry.public)
    }

    /// The peer's previous key, if still inside its grace window.
    pub fn previous_public(&mut self, peer_id: &str) -> Option<X25519PublicKey> {
        self.previous_public_at(peer_id, SystemTime::now())
    }

    pub(crate) fn previous_public_at(
        &mut self,
        peer_id: &str,
        now: SystemTime,
    ) -> Option<X25519PublicKey> {
        let entry = self.peers.get_mut(peer_id)?;
        if let Some((_, expires_at)) = entry.previous {
            if now >= expires_at {
                entry.previous = None;
            }
        }
        entry.previous.map(|(public, _)| public)
    }

    pub fn ratchet_mut(&mut self, peer_id: &str) -> Option<&mut DoubleRatchet> {
        self.peers.get_mut(peer_id)?.ratchet.as_mut()
    }

    /// Transfers a channel to a new session id, as happens when the relay
    /// assigns a reconnecting nickname a fresh UUID.
    pub fn migrate_ratchet(&mut self, old_peer_id: &str, new_peer_id: &str) -> Result<(), Error> {
        let entry = self
            .peers
            .remove(old_peer_id)
            .ok_or_else(|| Error::Protocol(format!("unknown peer: {old_peer_id}")))?;

        self.peers.insert(new_peer_id.to_string(), entry);
        tracing::info!(from = %old_peer_id, to = %new_peer_id, "migrated ratchet");
        Ok(())
    }

    /// Drops a peer, wiping its ratchet secrets.
    pub fn remove_peer(&mut self, peer_id: &str) {
        self.peers.remove(peer_id);
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = &str> {
        self.peers.keys().map(String::as_str)
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&str, &PeerEntry)> {
        self.peers.iter().map(|(id, entry)| (id.as_str(), entry))
    }

    pub(crate) fn insert_restored(
        &mut self,
        peer_id: String,
        public: X25519PublicKey,
        ratchet: Option<DoubleRatchet>,
    ) {
        self.peers.insert(
            peer_id,
            PeerEntry {
                public,
                previous: None,
                ratchet,
            },
        );
    }
}
