//! Serialized forms of the live state.
//!
//! Every secret travels base64-encoded and is restored into a wiping
//! container on load; each fixed-size field is length-checked before a key
//! is constructed from it.

use crate::crypto::{b64, b64_opt, decode_exact, unix_ms};
use crate::error::Error;
use crate::identity::Identity;
use crate::ratchet::{DoubleRatchet, RatchetState, SkippedKey};
use crate::registry::HandshakeRegistry;
use crate::session::Session;
use crate::types::{X25519PublicKey, X25519Secret};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, UNIX_EPOCH};
use zeroize::Zeroize;

const STATE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
pub struct IdentityState {
    #[serde(with = "b64")]
    secret: Vec<u8>,
    #[serde(with = "b64")]
    public: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
pub struct SkippedKeyState {
    #[serde(with = "b64")]
    ephemeral_public: Vec<u8>,
    counter: u32,
    #[serde(with = "b64")]
    message_key: Vec<u8>,
    inserted_at_ms: u64,
}

#[derive(Serialize, Deserialize)]
pub struct RatchetSnapshot {
    #[serde(with = "b64")]
    root_key: Vec<u8>,
    #[serde(default, with = "b64_opt")]
    send_chain_key: Option<Vec<u8>>,
    #[serde(default, with = "b64_opt")]
    recv_chain_key: Option<Vec<u8>>,
    send_counter: u32,
    recv_counter: u32,
    previous_send_count: u32,
    #[serde(default, with = "b64_opt")]
    my_eph_secret: Option<Vec<u8>>,
    #[serde(default, with = "b64_opt")]
    my_eph_public: Option<Vec<u8>>,
    #[serde(default, with = "b64_opt")]
    peer_eph_public: Option<Vec<u8>>,
    initialized: bool,
    need_send_ratchet: bool,
    skipped: Vec<SkippedKeyState>,
}

#[derive(Serialize, Deserialize)]
pub struct PeerState {
    peer_id: String,
    #[serde(with = "b64")]
    public: Vec<u8>,
    ratchet: Option<RatchetSnapshot>,
}

/// The complete persistable state of one [`Session`].
#[derive(Serialize, Deserialize)]
pub struct SessionState {
    version: u32,
    identity: IdentityState,
    local_id: Option<String>,
    peers: Vec<PeerState>,
}

fn optional_key(bytes: &Option<Box<[u8; 32]>>) -> Option<Vec<u8>> {
    bytes.as_ref().map(|key| key.to_vec())
}

fn restore_optional_key(
    bytes: &Option<Vec<u8>>,
    what: &str,
) -> Result<Option<Box<[u8; 32]>>, Error> {
    bytes
        .as_ref()
        .map(|key| decode_exact::<32>(key, what).map(Box::new))
        .transpose()
}

impl DoubleRatchet {
    /// Exports the full ratchet, skipped keys included.
    pub fn snapshot(&self) -> RatchetSnapshot {
        RatchetSnapshot {
            root_key: self.state.root_key.to_vec(),
            send_chain_key: optional_key(&self.state.send_chain_key),
            recv_chain_key: optional_key(&self.state.recv_chain_key),
            send_counter: self.state.send_counter,
            recv_counter: self.state.recv_counter,
            previous_send_count: self.state.previous_send_count,
            my_eph_secret: self
                .state
                .my_eph_secret
                .as_ref()
                .map(|secret| secret.to_bytes().to_vec()),
            my_eph_public: self
                .state
                .my_eph_public
                .map(|public| public.to_bytes().to_vec()),
            peer_eph_public: self
                .state
                .peer_eph_public
                .map(|public| public.to_bytes().to_vec()),
            initialized: self.state.initialized,
            need_send_ratchet: self.state.need_send_ratchet,
            skipped: self
                .skipped
                .iter()
                .map(|((ephemeral, counter), skipped)| SkippedKeyState {
                    ephemeral_public: ephemeral.to_vec(),
                    counter: *counter,
                    message_key: skipped.key.to_vec(),
                    inserted_at_ms: unix_ms(skipped.inserted_at),
                })
                .collect(),
        }
    }

    /// Rebuilds a ratchet from its exported form.
    pub fn restore(snapshot: &RatchetSnapshot) -> Result<Self, Error> {
        let root_key = Box::new(decode_exact::<32>(&snapshot.root_key, "root key")?);

        let my_eph_secret = snapshot
            .my_eph_secret
            .as_ref()
            .map(|secret| {
                decode_exact::<32>(secret, "ephemeral secret").map(X25519Secret::from)
            })
            .transpose()?;
        let my_eph_public = snapshot
            .my_eph_public
            .as_ref()
            .map(|public| {
                decode_exact::<32>(public, "ephemeral public").map(X25519PublicKey::from)
            })
            .transpose()?;
        let peer_eph_public = snapshot
            .peer_eph_public
            .as_ref()
            .map(|public| {
                decode_exact::<32>(public, "peer ephemeral").map(X25519PublicKey::from)
            })
            .transpose()?;

        let mut skipped = HashMap::with_capacity(snapshot.skipped.len());
        for entry in &snapshot.skipped {
            let ephemeral = decode_exact::<32>(&entry.ephemeral_public, "skipped-key ephemeral")?;
            let key = Box::new(decode_exact::<32>(&entry.message_key, "skipped message key")?);
            skipped.insert(
                (ephemeral, entry.counter),
                SkippedKey {
                    key,
                    inserted_at: UNIX_EPOCH + Duration::from_millis(entry.inserted_at_ms),
                },
            );
        }

        Ok(Self {
            state: RatchetState {
                root_key,
                send_chain_key: restore_optional_key(&snapshot.send_chain_key, "send chain key")?,
                recv_chain_key: restore_optional_key(&snapshot.recv_chain_key, "recv chain key")?,
                send_counter: snapshot.send_counter,
                recv_counter: snapshot.recv_counter,
                previous_send_count: snapshot.previous_send_count,
                my_eph_secret,
                my_eph_public,
                peer_eph_public,
                initialized: snapshot.initialized,
                need_send_ratchet: snapshot.need_send_ratchet,
            },
            skipped,
        })
    }
}

impl Identity {
    /// Exports the current generation. A previous key mid-grace is not
    /// persisted; its window would not survive a restart anyway.
    pub fn snapshot(&self) -> IdentityState {
        IdentityState {
            secret: self.secret().to_bytes().to_vec(),
            public: self.public().to_bytes().to_vec(),
        }
    }

    pub fn restore(state: &IdentityState) -> Result<Self, Error> {
        let secret = X25519Secret::from(decode_exact::<32>(&state.secret, "identity secret")?);
        let identity = Identity::from_parts(secret);

        let public = decode_exact::<32>(&state.public, "identity public")?;
        if identity.public().to_bytes() != public {
            return Err(Error::Identity(
                "identity public key does not match its secret".to_string(),
            ));
        }

        Ok(identity)
    }
}

impl Session {
    /// Exports everything the vault persists: identity, registry, ratchets,
    /// and the local session id.
    pub fn snapshot(&self) -> SessionState {
        SessionState {
            version: STATE_VERSION,
            identity: self.identity.snapshot(),
            local_id: self.registry.local_id().map(str::to_string),
            peers: self
                .registry
                .entries()
                .map(|(peer_id, entry)| PeerState {
                    peer_id: peer_id.to_string(),
                    public: entry.public.to_bytes().to_vec(),
                    ratchet: entry.ratchet.as_ref().map(DoubleRatchet::snapshot),
                })
                .collect(),
        }
    }

    /// Rebuilds a session around a restored identity and registry.
    pub fn restore(state: &SessionState, trust: crate::trust::TrustStore) -> Result<Self, Error> {
        if state.version != STATE_VERSION {
            return Err(Error::Serde(format!(
                "unsupported state version: {}",
                state.version
            )));
        }

        let identity = Identity::restore(&state.identity)?;
        let mut registry = HandshakeRegistry::default();

        for peer in &state.peers {
            let public = X25519PublicKey::from(decode_exact::<32>(&peer.public, "peer public")?);
            let ratchet = peer
                .ratchet
                .as_ref()
                .map(DoubleRatchet::restore)
                .transpose()?;
            registry.insert_restored(peer.peer_id.clone(), public, ratchet);
        }

        if let Some(local_id) = &state.local_id {
            registry.set_local_session_id(local_id, &identity)?;
        }

        Ok(Session::from_parts(identity, registry, trust))
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.identity.secret.zeroize();
        for peer in &mut self.peers {
            if let Some(ratchet) = &mut peer.ratchet {
                ratchet.root_key.zeroize();
                if let Some(key) = ratchet.send_chain_key.as_mut() {
                    key.zeroize();
                }
                if let Some(key) = ratchet.recv_chain_key.as_mut() {
                    key.zeroize();
                }
                if let Some(secret) = ratchet.my_eph_secret.as_mut() {
                    secret.zeroize();
                }
                for skipped in &mut ratchet.skipped {
                    skipped.message_key.zeroize();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::X25519Secret;

    fn ratchet_pair() -> (DoubleRatchet, DoubleRatchet) {
        let alice_static = X25519Secret::generate().unwrap();
        let bob_static = X25519Secret::generate().unwrap();

        let alice = DoubleRatchet::initialize(
            "alice",
            "bob",
            &alice_static,
            &bob_static.public_key(),
        )
        .unwrap();
        let bob = DoubleRatchet::initialize(
            "bob",
            "alice",
            &bob_static,
            &alice_static.public_key(),
        )
        .unwrap();

        (alice, bob)
    }

    #[test]
    fn test_ratchet_snapshot_restore_is_transparent() {
        let (mut alice, mut bob) = ratchet_pair();

        let first = alice.encrypt(b"before snapshot").unwrap();
        bob.decrypt(&first).unwrap();

        let snapshot = serde_json::to_string(&bob.snapshot()).unwrap();
        let parsed: RatchetSnapshot = serde_json::from_str(&snapshot).unwrap();
        let mut restored = DoubleRatchet::restore(&parsed).unwrap();

        // The live counterpart keeps sending; the restored ratchet follows.
        let second = alice.encrypt(b"after snapshot").unwrap();
        assert_eq!(
            restored.decrypt(&second).unwrap().as_slice(),
            b"after snapshot"
        );
    }

    #[test]
    fn test_snapshot_preserves_skipped_keys() {
        let (mut alice, mut bob) = ratchet_pair();

        let delayed = alice.encrypt(b"delayed").unwrap();
        let fresh = alice.encrypt(b"fresh").unwrap();
        bob.decrypt(&fresh).unwrap();

        let snapshot = bob.snapshot();
        let mut restored = DoubleRatchet::restore(&snapshot).unwrap();
        assert_eq!(restored.decrypt(&delayed).unwrap().as_slice(), b"delayed");
    }

    #[test]
    fn test_restore_rejects_bad_lengths() {
        let (alice, _) = ratchet_pair();

        let mut snapshot = alice.snapshot();
        snapshot.root_key.truncate(16);
        assert!(DoubleRatchet::restore(&snapshot).is_err());
    }

    #[test]
    fn test_identity_roundtrip() {
        let identity = Identity::new().unwrap();
        let restored = Identity::restore(&identity.snapshot()).unwrap();
        assert_eq!(restored.public(), identity.public());
    }

    #[test]
    fn test_identity_restore_rejects_mismatched_public() {
        let identity = Identity::new().unwrap();
        let other = Identity::new().unwrap();

        let mut state = identity.snapshot();
        state.public = other.public().to_bytes().to_vec();
        assert!(Identity::restore(&state).is_err());
    }
}
