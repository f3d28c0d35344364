//! Plausibly-deniable symmetric path.
//!
//! The channel key is the `crypto_box` precomputed (beforenm) key, which
//! either party can derive from their secret and the other's public key.
//! A ciphertext therefore proves membership of the pair, never authorship.
//!
//! Policy: deniable frames bypass the nonce-manager replay gate. Replay
//! protection keyed on a sender counter would reintroduce exactly the
//! sender attribution this mode exists to avoid.

use crate::error::Error;
use crate::nonce::Nonce;
use crate::padding::{pad, secure_unpad};
use crate::types::{X25519PublicKey, X25519Secret};
use crypto_box::aead::Aead;
use crypto_box::{PublicKey as BoxPublicKey, SalsaBox, SecretKey as BoxSecretKey};
use zeroize::{Zeroize, Zeroizing};

/// A pairwise deniable channel holding the precomputed shared key.
pub struct DeniableChannel {
    shared: SalsaBox,
}

impl DeniableChannel {
    /// Derives the shared key; both directions produce the same channel.
    pub fn new(peer_public: &X25519PublicKey, my_secret: &X25519Secret) -> Self {
        Self {
            shared: SalsaBox::new(
                &BoxPublicKey::from(peer_public.to_bytes()),
                &BoxSecretKey::from(my_secret.to_bytes()),
            ),
        }
    }

    /// Pads and seals under the shared key.
    pub fn encrypt(&self, plaintext: &[u8], nonce: &Nonce) -> Result<Vec<u8>, Error> {
        let mut padded = pad(plaintext)?;
        let sealed = self
            .shared
            .encrypt(&crypto_box::Nonce::from(nonce.to_bytes()), padded.as_slice())
            .map_err(|_| Error::Crypto("deniable seal failed".to_string()));
        padded.zeroize();
        sealed
    }

    /// Opens and unpads, or `None` on MAC failure.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &Nonce) -> Option<Zeroizing<Vec<u8>>> {
        let mut padded = self
            .shared
            .decrypt(&crypto_box::Nonce::from(nonce.to_bytes()), ciphertext)
            .ok()?;
        secure_unpad(&mut padded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonce::NonceManager;

    #[test]
    fn test_either_party_derives_the_same_channel() {
        let alice = X25519Secret::generate().unwrap();
        let bob = X25519Secret::generate().unwrap();
        let nonce = NonceManager::new().generate().unwrap();

        let alice_channel = DeniableChannel::new(&bob.public_key(), &alice);
        let bob_channel = DeniableChannel::new(&alice.public_key(), &bob);

        let sealed = alice_channel.encrypt(b"deniable", &nonce).unwrap();
        let opened = bob_channel.decrypt(&sealed, &nonce).unwrap();
        assert_eq!(opened.as_slice(), b"deniable");

        // And symmetrically: Bob's ciphertexts open on Alice's side.
        let sealed = bob_channel.encrypt(b"reply", &nonce).unwrap();
        let opened = alice_channel.decrypt(&sealed, &nonce).unwrap();
        assert_eq!(opened.as_slice(), b"reply");
    }

    #[test]
    fn test_outsider_cannot_decrypt() {
        let alice = X25519Secret::generate().unwrap();
        let bob = X25519Secret::generate().unwrap();
        let eve = X25519Secret::generate().unwrap();
        let nonce = NonceManager::new().generate().unwrap();

        let channel = DeniableChannel::new(&bob.public_key(), &alice);
        let sealed = channel.encrypt(b"pairwise only", &nonce).unwrap();

        let eve_channel = DeniableChannel::new(&alice.public_key(), &eve);
        assert!(eve_channel.decrypt(&sealed, &nonce).is_none());
    }

    #[test]
    fn test_tampering_is_detected() {
        let alice = X25519Secret::generate().unwrap();
        let bob = X25519Secret::generate().unwrap();
        let nonce = NonceManager::new().generate().unwrap();

        let channel = DeniableChannel::new(&bob.public_key(), &alice);
        let mut sealed = channel.encrypt(b"payload", &nonce).unwrap();
        sealed[8] ^= 0x80;

        let bob_channel = DeniableChannel::new(&alice.public_key(), &bob);
        assert!(bob_channel.decrypt(&sealed, &nonce).is_none());
    }
}
