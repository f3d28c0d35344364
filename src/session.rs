//! The value a controller passes around: one local endpoint owning its
//! identity, peer registry, trust store, and nonce state.
//!
//! All three send paths funnel through here, and receive-side dispatch
//! follows the wire payload shape: ratchet frames rely on their own
//! counters, static frames pass the nonce replay gate before any decrypt
//! attempt (covering every fallback combination), and deniable frames
//! skip the gate by policy.

use crate::deniable::DeniableChannel;
use crate::error::Error;
use crate::identity::Identity;
use crate::nonce::NonceManager;
use crate::registry::HandshakeRegistry;
use crate::static_box;
use crate::trust::{TrustCheck, TrustStore, sas_code};
use crate::types::X25519PublicKey;
use crate::vault::StateVault;
use crate::wire::{EncryptedPayload, WireMessage};
use zeroize::Zeroizing;

/// One local endpoint of the mesh.
pub struct Session {
    pub(crate) identity: Identity,
    pub(crate) registry: HandshakeRegistry,
    pub(crate) trust: TrustStore,
    pub(crate) nonces: NonceManager,
}

impl Session {
    /// Creates a session with a freshly generated identity.
    pub fn new(trust: TrustStore) -> Result<Self, Error> {
        Ok(Self {
            identity: Identity::new()?,
            registry: HandshakeRegistry::new(),
            trust,
            nonces: NonceManager::new(),
        })
    }

    pub(crate) fn from_parts(
        identity: Identity,
        registry: HandshakeRegistry,
        trust: TrustStore,
    ) -> Self {
        Self {
            identity,
            registry,
            trust,
            nonces: NonceManager::new(),
        }
    }

    pub fn public_key(&self) -> X25519PublicKey {
        self.identity.public()
    }

    pub fn fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    pub fn local_id(&self) -> Option<&str> {
        self.registry.local_id()
    }

    /// Adopts the session id the relay assigned (or the nickname in P2P
    /// mode), initializing any deferred ratchets.
    pub fn set_local_id(&mut self, id: &str) -> Result<(), Error> {
        self.registry.set_local_session_id(id, &self.identity)
    }

    /// First sight of a peer key (join, roster, reconnect). A new peer is
    /// pinned and registered; a trusted peer is (re)registered; a mismatch
    /// touches nothing and is handed back for the user to resolve.
    pub fn observe_peer(
        &mut self,
        session_id: &str,
        nickname: &str,
        public: X25519PublicKey,
    ) -> Result<TrustCheck, Error> {
        let check = self.trust.check(nickname, &public);

        match check {
            TrustCheck::NewPeer => {
                self.trust.record(nickname, &public)?;
                self.registry.register_peer(session_id, public, &self.identity)?;
            }
            TrustCheck::Trusted => {
                if !self.registry.contains(session_id) {
                    self.registry.register_peer(session_id, public, &self.identity)?;
                }
            }
            TrustCheck::Mismatch | TrustCheck::VerifiedMismatch => {}
        }

        Ok(check)
    }

    /// User-approved key replacement after a mismatch warning. Clears the
    /// verified flag and (re)registers the channel.
    pub fn trust_peer(
        &mut self,
        session_id: &str,
        nickname: &str,
        public: X25519PublicKey,
    ) -> Result<(), Error> {
        self.trust.update(nickname, &public)?;
        if self.registry.contains(session_id) {
            self.registry.update_peer_key(session_id, public)
        } else {
            self.registry.register_peer(session_id, public, &self.identity)
        }
    }

    /// Authenticated in-channel rotation (`key_update` arriving through an
    /// established channel): verification status survives.
    pub fn apply_peer_rotation(
        &mut self,
        session_id: &str,
        nickname: &str,
        public: X25519PublicKey,
    ) -> Result<(), Error> {
        self.trust.auto_update(nickname, &public)?;
        self.registry.update_peer_key(session_id, public)
    }

    /// The 6-digit code both ends compare out of band.
    pub fn verification_code(&self, peer_public: &X25519PublicKey) -> String {
        sas_code(&self.identity.public(), peer_public)
    }

    pub fn confirm_verified(&mut self, nickname: &str) -> Result<(), Error> {
        self.trust.mark_verified(nickname)
    }

    /// A reconnecting nickname came back under a fresh relay session id.
    pub fn migrate_peer(&mut self, old_session_id: &str, new_session_id: &str) -> Result<(), Error> {
        self.registry.migrate_ratchet(old_session_id, new_session_id)
    }

    /// Drops a departed peer, wiping its channel.
    pub fn remove_peer(&mut self, session_id: &str) {
        self.registry.remove_peer(session_id);
        self.nonces.remove_peer(session_id);
    }

    /// Rotates the local identity and returns the `key_update` frame to
    /// announce it.
    pub fn rotate_identity(&mut self) -> Result<WireMessage, Error> {
        self.identity.rotate()?;
        Ok(WireMessage::KeyUpdate {
            public_key: self.identity.public(),
        })
    }

    fn local_id_required(&self) -> Result<String, Error> {
        self.registry
            .local_id()
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol("local session id not set".to_string()))
    }

    /// Forward-secret send over the peer's ratchet.
    pub fn encrypt_to(&mut self, peer_id: &str, plaintext: &[u8]) -> Result<WireMessage, Error> {
        let from = self.local_id_required()?;
        let ratchet = self
            .registry
            .ratchet_mut(peer_id)
            .ok_or_else(|| Error::Protocol(format!("no channel for peer: {peer_id}")))?;

        Ok(WireMessage::Encrypted {
            from,
            to: peer_id.to_string(),
            payload: EncryptedPayload::Ratchet(ratchet.encrypt(plaintext)?),
        })
    }

    /// Static-box send for peers currently offline.
    pub fn encrypt_static_to(
        &mut self,
        peer_id: &str,
        plaintext: &[u8],
    ) -> Result<WireMessage, Error> {
        let from = self.local_id_required()?;
        let peer_public = self
            .registry
            .peer_public(peer_id)
            .ok_or_else(|| Error::Protocol(format!("unknown peer: {peer_id}")))?;

        let nonce = self.nonces.generate()?;
        let ciphertext =
            static_box::encrypt(plaintext, &nonce, &peer_public, self.identity.secret())?;

        Ok(WireMessage::Encrypted {
            from,
            to: peer_id.to_string(),
            payload: EncryptedPayload::Static { ciphertext, nonce },
        })
    }

    /// Deniable send over the shared pairwise key.
    pub fn encrypt_deniable_to(
        &mut self,
        peer_id: &str,
        plaintext: &[u8],
    ) -> Result<WireMessage, Error> {
        let from = self.local_id_required()?;
        let peer_public = self
            .registry
            .peer_public(peer_id)
            .ok_or_else(|| Error::Protocol(format!("unknown peer: {peer_id}")))?;

        let nonce = self.nonces.generate()?;
        let channel = DeniableChannel::new(&peer_public, self.identity.secret());
        let ciphertext = channel.encrypt(plaintext, &nonce)?;

        Ok(WireMessage::Encrypted {
            from,
            to: peer_id.to_string(),
            payload: EncryptedPayload::Deniable { ciphertext, nonce },
        })
    }

    /// Receive-side dispatch over the three payload shapes.
    pub fn decrypt_from(
        &mut self,
        from: &str,
        payload: &EncryptedPayload,
    ) -> Option<Zeroizing<Vec<u8>>> {
        match payload {
            EncryptedPayload::Ratchet(message) => {
                self.registry.ratchet_mut(from)?.decrypt(message)
            }
            EncryptedPayload::Static { ciphertext, nonce } => {
                if let Err(err) = self.nonces.accept(from, nonce.as_bytes()) {
                    tracing::warn!(peer = %from, error = %err, "static frame rejected");
                    return None;
                }

                let sender_public = self.registry.peer_public(from)?;
                let previous_sender = self.registry.previous_public(from);
                self.identity.expire_previous();
                let previous_identity = self.identity.previous_keys();

                static_box::decrypt_with_fallback(
                    ciphertext,
                    nonce,
                    &sender_public,
                    self.identity.secret(),
                    previous_sender.as_ref(),
                    previous_identity.map(|(secret, _)| secret),
                )
            }
            EncryptedPayload::Deniable { ciphertext, nonce } => {
                let peer_public = self.registry.peer_public(from)?;
                let channel = DeniableChannel::new(&peer_public, self.identity.secret());
                channel.decrypt(ciphertext, nonce)
            }
        }
    }

    /// Seals the whole session state into the vault under `passphrase`.
    pub fn persist_to(&self, vault: &StateVault, passphrase: &str) -> Result<(), Error> {
        let (kek, salt) = StateVault::derive_kek(passphrase, None)?;
        vault.save(&self.snapshot(), &kek, &salt)
    }

    /// Restores a session from the vault, or `None` when the passphrase is
    /// wrong, the envelope is corrupt, or no state exists.
    pub fn restore_from(vault: &StateVault, passphrase: &str, trust: TrustStore) -> Option<Self> {
        let state = vault.load::<crate::persist::SessionState>(passphrase)?;
        Session::restore(&state, trust).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session() -> (Session, TempDir) {
        let dir = TempDir::new().unwrap();
        let trust = TrustStore::open(dir.path()).unwrap();
        (Session::new(trust).unwrap(), dir)
    }

    fn connect(a: &mut Session, a_id: &str, b: &mut Session, b_id: &str) {
        a.set_local_id(a_id).unwrap();
        b.set_local_id(b_id).unwrap();
        a.observe_peer(b_id, b_id, b.public_key()).unwrap();
        b.observe_peer(a_id, a_id, a.public_key()).unwrap();
    }

    #[test]
    fn test_ratchet_roundtrip_between_sessions() {
        let (mut alice, _a) = session();
        let (mut bob, _b) = session();
        connect(&mut alice, "alice", &mut bob, "bob");

        let WireMessage::Encrypted { from, payload, .. } =
            alice.encrypt_to("bob", b"Ola Bob").unwrap()
        else {
            panic!("expected encrypted frame");
        };

        let plaintext = bob.decrypt_from(&from, &payload).unwrap();
        assert_eq!(plaintext.as_slice(), b"Ola Bob");
    }

    #[test]
    fn test_static_roundtrip_with_replay_rejection() {
        let (mut alice, _a) = session();
        let (mut bob, _b) = session();
        connect(&mut alice, "alice", &mut bob, "bob");

        let WireMessage::Encrypted { from, payload, .. } =
            alice.encrypt_static_to("bob", b"offline").unwrap()
        else {
            panic!("expected encrypted frame");
        };

        assert_eq!(
            bob.decrypt_from(&from, &payload).unwrap().as_slice(),
            b"offline"
        );
        // Same frame again: the nonce gate rejects it before any decrypt.
        assert!(bob.decrypt_from(&from, &payload).is_none());
    }

    #[test]
    fn test_deniable_roundtrip_is_replayable() {
        let (mut alice, _a) = session();
        let (mut bob, _b) = session();
        connect(&mut alice, "alice", &mut bob, "bob");

        let WireMessage::Encrypted { from, payload, .. } =
            alice.encrypt_deniable_to("bob", b"off the record").unwrap()
        else {
            panic!("expected encrypted frame");
        };

        assert_eq!(
            bob.decrypt_from(&from, &payload).unwrap().as_slice(),
            b"off the record"
        );
        // Deniable frames bypass the replay gate by policy.
        assert!(bob.decrypt_from(&from, &payload).is_some());
    }

    #[test]
    fn test_observe_peer_pins_then_trusts() {
        let (mut alice, _a) = session();
        let (bob, _b) = session();
        alice.set_local_id("alice").unwrap();

        assert_eq!(
            alice.observe_peer("bob-1", "Bob", bob.public_key()).unwrap(),
            TrustCheck::NewPeer
        );
        assert_eq!(
            alice.observe_peer("bob-1", "bob", bob.public_key()).unwrap(),
            TrustCheck::Trusted
        );
    }

    #[test]
    fn test_observe_peer_flags_changed_key() {
        let (mut alice, _a) = session();
        let (bob, _b) = session();
        let (impostor, _c) = session();
        alice.set_local_id("alice").unwrap();

        alice.observe_peer("bob-1", "bob", bob.public_key()).unwrap();
        assert_eq!(
            alice
                .observe_peer("bob-2", "bob", impostor.public_key())
                .unwrap(),
            TrustCheck::Mismatch
        );
        // The impostor key was not registered.
        assert!(!alice.registry.contains("bob-2"));
    }

    #[test]
    fn test_verification_codes_agree() {
        let (mut alice, _a) = session();
        let (mut bob, _b) = session();
        connect(&mut alice, "alice", &mut bob, "bob");

        assert_eq!(
            alice.verification_code(&bob.public_key()),
            bob.verification_code(&alice.public_key())
        );
    }

    #[test]
    fn test_identity_rotation_announces_new_key() {
        let (mut alice, _a) = session();
        let before = alice.public_key();

        let WireMessage::KeyUpdate { public_key } = alice.rotate_identity().unwrap() else {
            panic!("expected key_update frame");
        };
        assert_ne!(public_key, before);
        assert_eq!(public_key, alice.public_key());
    }

    #[test]
    fn test_static_decrypt_survives_sender_rotation() {
        let (mut alice, _a) = session();
        let (mut bob, _b) = session();
        connect(&mut alice, "alice", &mut bob, "bob");

        let WireMessage::Encrypted { from, payload, .. } =
            alice.encrypt_static_to("bob", b"pre-rotation").unwrap()
        else {
            panic!("expected encrypted frame");
        };

        // Alice rotates after sealing; Bob learns the new key but keeps the
        // old one in grace.
        let WireMessage::KeyUpdate { public_key } = alice.rotate_identity().unwrap() else {
            panic!("expected key_update frame");
        };
        bob.apply_peer_rotation("alice", "alice", public_key).unwrap();

        assert_eq!(
            bob.decrypt_from(&from, &payload).unwrap().as_slice(),
            b"pre-rotation"
        );
    }

    #[test]
    fn test_migrate_peer_keeps_channel_alive() {
        let (mut alice, _a) = session();
        let (mut bob, _b) = session();
        connect(&mut alice, "alice", &mut bob, "bob");

        // Warm the channel up.
        let WireMessage::Encrypted { payload, .. } = alice.encrypt_to("bob", b"hi").unwrap() else {
            panic!("expected encrypted frame");
        };
        bob.decrypt_from("alice", &payload).unwrap();

        // The relay reassigns Alice's session id on Bob's side.
        bob.migrate_peer("alice", "alice-reborn").unwrap();

        let WireMessage::Encrypted { payload, .. } = alice.encrypt_to("bob", b"still me").unwrap()
        else {
            panic!("expected encrypted frame");
        };
        assert_eq!(
            bob.decrypt_from("alice-reborn", &payload).unwrap().as_slice(),
            b"still me"
        );
    }

    #[test]
    fn test_vault_roundtrip_restores_working_channel() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let mut alice = Session::new(TrustStore::open(dir_a.path()).unwrap()).unwrap();
        let mut bob = Session::new(TrustStore::open(dir_b.path()).unwrap()).unwrap();
        connect(&mut alice, "alice", &mut bob, "bob");

        let WireMessage::Encrypted { payload, .. } = alice.encrypt_to("bob", b"one").unwrap()
        else {
            panic!("expected encrypted frame");
        };
        bob.decrypt_from("alice", &payload).unwrap();

        // Bob shuts down, persisting state; then comes back.
        let vault = StateVault::new(dir_b.path());
        bob.persist_to(&vault, "hunter2").unwrap();
        drop(bob);

        assert!(
            Session::restore_from(&vault, "hunter3", TrustStore::open(dir_b.path()).unwrap())
                .is_none()
        );
        let mut restored =
            Session::restore_from(&vault, "hunter2", TrustStore::open(dir_b.path()).unwrap())
                .unwrap();

        let WireMessage::Encrypted { payload, .. } = alice.encrypt_to("bob", b"two").unwrap()
        else {
            panic!("expected encrypted frame");
        };
        assert_eq!(
            restored.decrypt_from("alice", &payload).unwrap().as_slice(),
            b"two"
        );
    }
}
