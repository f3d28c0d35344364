//! Double Ratchet over X25519 and XSalsa20-Poly1305.
//!
//! A DH "outer" ratchet advances whenever a fresh peer ephemeral is seen;
//! a keyed-BLAKE2b "inner" chain derives one single-use message key per
//! frame. The send ratchet is lazy: receiving a new peer ephemeral only
//! flags `need_send_ratchet`, and the next `encrypt` call performs the
//! step. Skipped message keys are cached briefly so frames may arrive out
//! of order.

mod message;
mod state;

pub use crate::ratchet::message::RatchetMessage;
pub(crate) use crate::ratchet::state::RatchetState;

use crate::crypto::{blake2b_256, fill_random, Blake2bMac256, Blake2bMac512};
use crate::error::Error;
use crate::nonce::Nonce;
use crate::padding::{pad, secure_unpad};
use crate::types::{X25519PublicKey, X25519Secret};
use blake2::digest::Mac;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Upper bound on message keys derived ahead for one decrypt.
pub const MAX_SKIP: u32 = 100;

/// Wall-clock lifetime of a cached skipped key.
pub const SKIPPED_KEY_TTL: Duration = Duration::from_secs(60);

/// A message key retained for an out-of-order frame.
#[derive(Clone)]
pub(crate) struct SkippedKey {
    pub(crate) key: Box<[u8; 32]>,
    pub(crate) inserted_at: SystemTime,
}

impl Zeroize for SkippedKey {
    fn zeroize(&mut self) {
        self.key.zeroize();
    }
}

impl Drop for SkippedKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl ZeroizeOnDrop for SkippedKey {}

/// Per-peer forward-secret channel.
pub struct DoubleRatchet {
    pub(crate) state: RatchetState,
    // (peer ephemeral, counter) -> message key
    pub(crate) skipped: HashMap<([u8; 32], u32), SkippedKey>,
}

impl Zeroize for DoubleRatchet {
    fn zeroize(&mut self) {
        self.state.zeroize();
        for (_, mut skipped) in self.skipped.drain() {
            skipped.zeroize();
        }
    }
}

impl Drop for DoubleRatchet {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl ZeroizeOnDrop for DoubleRatchet {}

/// `KDF_CK`: one step of the symmetric chain. Returns `(message_key,
/// next_chain_key)`; the caller wipes the old chain key.
fn kdf_ck(chain_key: &[u8; 32]) -> (Box<[u8; 32]>, Box<[u8; 32]>) {
    let derive = |label: u8| {
        let mut mac = <Blake2bMac256 as Mac>::new_from_slice(chain_key)
            .expect("BLAKE2b accepts 32-byte keys");
        mac.update(&[label]);
        let mut output = mac.finalize().into_bytes();

        let mut key = Box::new([0u8; 32]);
        key.copy_from_slice(&output);
        output.as_mut_slice().zeroize();
        key
    };

    (derive(0x01), derive(0x02))
}

impl DoubleRatchet {
    /// Builds the channel from both parties' static identity keys.
    ///
    /// The session-identifier tie-break picks the initiator: the side with
    /// the byte-lexicographically smaller id generates an ephemeral pair
    /// up front and bootstraps `peer_eph_public` with the peer's static
    /// key; the responder parks a copy of its static secret as the
    /// ephemeral placeholder until the first inbound ratchet step.
    pub fn initialize(
        my_id: &str,
        peer_id: &str,
        my_static_secret: &X25519Secret,
        peer_static_public: &X25519PublicKey,
    ) -> Result<Self, Error> {
        let dh0 = my_static_secret.dh(peer_static_public);
        let mut root = blake2b_256(dh0.as_bytes());
        let root_key = Box::new(root);
        root.zeroize();
        drop(dh0);

        let initiator = my_id.as_bytes() < peer_id.as_bytes();
        let (my_eph_secret, my_eph_public, peer_eph_public) = if initiator {
            let secret = X25519Secret::generate()?;
            let public = secret.public_key();
            (Some(secret), Some(public), Some(*peer_static_public))
        } else {
            (Some(my_static_secret.clone()), None, None)
        };

        Ok(Self {
            state: RatchetState {
                root_key,
                send_chain_key: None,
                recv_chain_key: None,
                send_counter: 0,
                recv_counter: 0,
                previous_send_count: 0,
                my_eph_secret,
                my_eph_public,
                peer_eph_public,
                initialized: true,
                need_send_ratchet: true,
            },
            skipped: HashMap::new(),
        })
    }

    /// `KDF_RK`: folds a DH output into the root key, yielding a chain key.
    fn kdf_rk(&mut self, dh_output: &[u8; 32]) -> Box<[u8; 32]> {
        let mut mac = <Blake2bMac512 as Mac>::new_from_slice(self.state.root_key.as_slice())
            .expect("BLAKE2b accepts 32-byte keys");
        mac.update(dh_output);
        let mut output = mac.finalize().into_bytes();

        let mut new_root = Box::new([0u8; 32]);
        new_root.copy_from_slice(&output[..32]);
        let mut chain_key = Box::new([0u8; 32]);
        chain_key.copy_from_slice(&output[32..]);
        output.as_mut_slice().zeroize();

        self.state.root_key.zeroize();
        self.state.root_key = new_root;
        chain_key
    }

    /// Encrypts one message, performing the pending send ratchet first.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage, Error> {
        if self.state.need_send_ratchet {
            let peer_eph = self
                .state
                .peer_eph_public
                .ok_or_else(|| Error::Protocol("no peer ephemeral yet".to_string()))?;

            self.state.previous_send_count = self.state.send_counter;
            self.state.send_counter = 0;

            // Replacing the old ephemeral secret wipes it on drop.
            let secret = X25519Secret::generate()?;
            let public = secret.public_key();
            let dh = secret.dh(&peer_eph);
            self.state.my_eph_secret = Some(secret);
            self.state.my_eph_public = Some(public);

            let chain_key = self.kdf_rk(dh.as_bytes());
            if let Some(old) = self.state.send_chain_key.as_mut() {
                old.zeroize();
            }
            self.state.send_chain_key = Some(chain_key);
            self.state.need_send_ratchet = false;

            tracing::debug!("send ratchet stepped");
        }

        let chain_key = self
            .state
            .send_chain_key
            .as_mut()
            .ok_or_else(|| Error::Protocol("send chain not initialized".to_string()))?;
        let (mut message_key, next_chain_key) = kdf_ck(chain_key);
        chain_key.zeroize();
        *chain_key = next_chain_key;

        let mut padded = pad(plaintext)?;
        let mut nonce = [0u8; 24];
        fill_random(&mut nonce)?;
        let sealed = crate::crypto::secretbox_seal(&message_key, &nonce, &padded);
        padded.zeroize();
        message_key.zeroize();
        let ciphertext = sealed?;

        let message = RatchetMessage {
            ciphertext,
            nonce: Nonce::from_slice(&nonce).expect("24-byte nonce"),
            ephemeral_public: self
                .state
                .my_eph_public
                .ok_or_else(|| Error::Protocol("send ratchet never ran".to_string()))?,
            counter: self.state.send_counter,
            previous_counter: self.state.previous_send_count,
        };
        self.state.send_counter = self.state.send_counter.wrapping_add(1);

        Ok(message)
    }

    /// Decrypts one message. Any failure leaves the chain state exactly as
    /// it was before the call (a consumed skipped key excepted).
    pub fn decrypt(&mut self, message: &RatchetMessage) -> Option<Zeroizing<Vec<u8>>> {
        self.decrypt_at(message, SystemTime::now())
    }

    pub(crate) fn decrypt_at(
        &mut self,
        message: &RatchetMessage,
        now: SystemTime,
    ) -> Option<Zeroizing<Vec<u8>>> {
        let eph_bytes = message.ephemeral_public.to_bytes();

        // Fast path: a key derived earlier for this exact frame. The entry
        // is consumed whether or not the MAC verifies.
        if let Some(mut skipped) = self.skipped.remove(&(eph_bytes, message.counter)) {
            if now
                .duration_since(skipped.inserted_at)
                .map_or(false, |age| age > SKIPPED_KEY_TTL)
            {
                return None;
            }
            let mut padded = crate::crypto::secretbox_open(
                &skipped.key,
                message.nonce.as_bytes(),
                &message.ciphertext,
            )?;
            skipped.zeroize();
            return secure_unpad(&mut padded);
        }

        let snapshot_state = self.state.clone();
        let snapshot_skipped = self.skipped.clone();

        match self.advance_and_open(message, eph_bytes, now) {
            Some(plaintext) => {
                self.sweep_skipped(now);
                Some(plaintext)
            }
            None => {
                self.state = snapshot_state;
                self.skipped = snapshot_skipped;
                None
            }
        }
    }

    fn advance_and_open(
        &mut self,
        message: &RatchetMessage,
        eph_bytes: [u8; 32],
        now: SystemTime,
    ) -> Option<Zeroizing<Vec<u8>>> {
        // DH ratchet step on a fresh peer ephemeral: close out the old
        // receive chain, then derive the new one.
        if self.state.peer_eph_public.map(|key| key.to_bytes()) != Some(eph_bytes) {
            if let Some(old_eph) = self.state.peer_eph_public {
                self.skip_recv_keys(old_eph.to_bytes(), message.previous_counter, now)
                    .ok()?;
            }

            self.state.peer_eph_public = Some(message.ephemeral_public);
            let dh = self
                .state
                .my_eph_secret
                .as_ref()?
                .dh(&message.ephemeral_public);
            let chain_key = self.kdf_rk(dh.as_bytes());
            if let Some(old) = self.state.recv_chain_key.as_mut() {
                old.zeroize();
            }
            self.state.recv_chain_key = Some(chain_key);
            self.state.recv_counter = 0;
            self.state.need_send_ratchet = true;

            tracing::debug!("receive ratchet stepped");
        }

        // Cache keys for any frames this one jumped over.
        if message.counter > self.state.recv_counter {
            self.skip_recv_keys(eph_bytes, message.counter, now).ok()?;
        }

        let chain_key = self.state.recv_chain_key.as_mut()?;
        let (mut message_key, next_chain_key) = kdf_ck(chain_key);
        chain_key.zeroize();
        *chain_key = next_chain_key;
        self.state.recv_counter = self.state.recv_counter.wrapping_add(1);

        let padded = crate::crypto::secretbox_open(
            &message_key,
            message.nonce.as_bytes(),
            &message.ciphertext,
        );
        message_key.zeroize();

        let mut padded = padded?;
        secure_unpad(&mut padded)
    }

    /// Derives and caches message keys from the current receive chain up
    /// to (excluding) `until`, keyed under `chain_public`.
    fn skip_recv_keys(
        &mut self,
        chain_public: [u8; 32],
        until: u32,
        now: SystemTime,
    ) -> Result<(), Error> {
        let Some(mut chain_key) = self.state.recv_chain_key.take() else {
            return Ok(());
        };

        if until > self.state.recv_counter && until - self.state.recv_counter > MAX_SKIP {
            self.state.recv_chain_key = Some(chain_key);
            return Err(Error::Protocol("too many skipped messages".to_string()));
        }

        while self.state.recv_counter < until {
            let (message_key, next_chain_key) = kdf_ck(&chain_key);
            chain_key.zeroize();
            chain_key = next_chain_key;

            self.skipped.insert(
                (chain_public, self.state.recv_counter),
                SkippedKey {
                    key: message_key,
                    inserted_at: now,
                },
            );
            self.state.recv_counter = self.state.recv_counter.wrapping_add(1);
        }

        self.state.recv_chain_key = Some(chain_key);
        Ok(())
    }

    /// Wipes cached keys past their wall-clock lifetime.
    fn sweep_skipped(&mut self, now: SystemTime) {
        self.skipped.retain(|_, skipped| {
            now.duration_since(skipped.inserted_at)
                .map_or(true, |age| age <= SKIPPED_KEY_TTL)
        });
    }

    /// Current own ephemeral public key, once the first send ratchet ran.
    pub fn ephemeral_public(&self) -> Option<X25519PublicKey> {
        self.state.my_eph_public
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_pair() -> (DoubleRatchet, DoubleRatchet) {
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
    fn test_basic_exchange() {
        let (mut alice, mut bob) = create_pair();

        let message = alice.encrypt(b"Ola Bob").unwrap();
        let plaintext = bob.decrypt(&message).unwrap();
        assert_eq!(plaintext.as_slice(), b"Ola Bob");

        let reply = bob.encrypt(b"Ola Alice").unwrap();
        let plaintext = alice.decrypt(&reply).unwrap();
        assert_eq!(plaintext.as_slice(), b"Ola Alice");
    }

    #[test]
    fn test_responder_cannot_send_first() {
        let (_, mut bob) = create_pair();
        assert!(bob.encrypt(b"premature").is_err());
    }

    #[test]
    fn test_long_conversation_rotates_ephemerals() {
        let (mut alice, mut bob) = create_pair();

        let first = alice.encrypt(b"first").unwrap();
        bob.decrypt(&first).unwrap();

        for round in 0..5 {
            let from_bob = bob.encrypt(format!("bob {round}").as_bytes()).unwrap();
            let plaintext = alice.decrypt(&from_bob).unwrap();
            assert_eq!(plaintext.as_slice(), format!("bob {round}").as_bytes());

            let from_alice = alice.encrypt(format!("alice {round}").as_bytes()).unwrap();
            let plaintext = bob.decrypt(&from_alice).unwrap();
            assert_eq!(plaintext.as_slice(), format!("alice {round}").as_bytes());
        }

        let last = alice.encrypt(b"last").unwrap();
        assert_ne!(
            first.ephemeral_public.as_bytes(),
            last.ephemeral_public.as_bytes(),
            "DH ratchet should have turned during the conversation"
        );
    }

    #[test]
    fn test_out_of_order_within_chain() {
        let (mut alice, mut bob) = create_pair();

        let messages: Vec<RatchetMessage> = (0..5)
            .map(|i| alice.encrypt(format!("msg {i}").as_bytes()).unwrap())
            .collect();

        for index in [2usize, 0, 4, 1, 3] {
            let plaintext = bob.decrypt(&messages[index]).unwrap();
            assert_eq!(plaintext.as_slice(), format!("msg {index}").as_bytes());
        }
    }

    #[test]
    fn test_skipped_key_is_single_use() {
        let (mut alice, mut bob) = create_pair();

        let first = alice.encrypt(b"one").unwrap();
        let second = alice.encrypt(b"two").unwrap();

        bob.decrypt(&second).unwrap();
        assert!(bob.decrypt(&first).is_some());
        // The cached key was consumed; a replay finds nothing.
        assert!(bob.decrypt(&first).is_none());
    }

    #[test]
    fn test_out_of_order_across_ratchet_steps() {
        let (mut alice, mut bob) = create_pair();

        let early = alice.encrypt(b"early").unwrap();
        let in_time = alice.encrypt(b"in time").unwrap();

        // Bob answers, forcing Alice onto a new sending chain.
        bob.decrypt(&in_time).unwrap();
        let reply = bob.encrypt(b"reply").unwrap();
        alice.decrypt(&reply).unwrap();

        let late_chain = alice.encrypt(b"new chain").unwrap();
        assert_eq!(bob.decrypt(&late_chain).unwrap().as_slice(), b"new chain");

        // The frame skipped in the old chain is still recoverable.
        assert_eq!(bob.decrypt(&early).unwrap().as_slice(), b"early");
    }

    #[test]
    fn test_tampering_detected_and_state_preserved() {
        let (mut alice, mut bob) = create_pair();

        let intact = alice.encrypt(b"intact").unwrap();
        let mut tampered = alice.encrypt(b"tampered").unwrap();
        tampered.ciphertext[0] ^= 0x01;

        let counter_before = bob.state.recv_counter;
        assert!(bob.decrypt(&tampered).is_none());
        assert_eq!(bob.state.recv_counter, counter_before);

        // The channel keeps working in order.
        assert_eq!(bob.decrypt(&intact).unwrap().as_slice(), b"intact");
    }

    #[test]
    fn test_skip_limit_is_enforced() {
        let (mut alice, mut bob) = create_pair();

        let first = alice.encrypt(b"0").unwrap();
        bob.decrypt(&first).unwrap();

        let mut over_limit = None;
        for i in 1..=(MAX_SKIP + 2) {
            over_limit = Some(alice.encrypt(format!("{i}").as_bytes()).unwrap());
        }

        // Gap of MAX_SKIP + 1 intermediate keys: rejected for this message.
        assert!(bob.decrypt(&over_limit.unwrap()).is_none());

        // The channel itself survives: a reply establishes fresh chains.
        let reply = bob.encrypt(b"recovery").unwrap();
        assert_eq!(alice.decrypt(&reply).unwrap().as_slice(), b"recovery");
    }

    #[test]
    fn test_skipped_keys_expire() {
        let (mut alice, mut bob) = create_pair();
        let now = SystemTime::now();

        let delayed = alice.encrypt(b"delayed").unwrap();
        let fresh = alice.encrypt(b"fresh").unwrap();

        // Receiving `fresh` caches a key for `delayed`.
        assert!(bob.decrypt_at(&fresh, now).is_some());

        let past_ttl = now + SKIPPED_KEY_TTL + Duration::from_secs(1);
        assert!(bob.decrypt_at(&delayed, past_ttl).is_none());
    }

    #[test]
    fn test_distinct_message_keys_per_send() {
        let (mut alice, _) = create_pair();

        let first = alice.encrypt(b"same plaintext").unwrap();
        let second = alice.encrypt(b"same plaintext").unwrap();

        assert_eq!(first.ephemeral_public, second.ephemeral_public);
        assert_ne!(first.counter, second.counter);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn test_third_party_cannot_decrypt() {
        let (mut alice, _) = create_pair();
        let (_, mut mallory) = create_pair();

        let message = alice.encrypt(b"for bob only").unwrap();
        assert!(mallory.decrypt(&message).is_none());
    }
}
