//! Authenticated public-key encryption for the offline-message fallback.
//!
//! `crypto_box` (X25519 + XSalsa20-Poly1305) over padded frames. Because
//! either endpoint may be mid-rotation, decryption can fall back across
//! the previous generation of both the sender's public and the recipient's
//! secret key.

use crate::error::Error;
use crate::nonce::Nonce;
use crate::padding::{pad, secure_unpad};
use crate::types::{X25519PublicKey, X25519Secret};
use crypto_box::aead::Aead;
use crypto_box::{PublicKey as BoxPublicKey, SalsaBox, SecretKey as BoxSecretKey};
use zeroize::Zeroize;

fn salsa_box(public: &X25519PublicKey, secret: &X25519Secret) -> SalsaBox {
    SalsaBox::new(
        &BoxPublicKey::from(public.to_bytes()),
        &BoxSecretKey::from(secret.to_bytes()),
    )
}

/// Pads and seals `plaintext` to `recipient_public`.
pub fn encrypt(
    plaintext: &[u8],
    nonce: &Nonce,
    recipient_public: &X25519PublicKey,
    sender_secret: &X25519Secret,
) -> Result<Vec<u8>, Error> {
    let mut padded = pad(plaintext)?;
    let sealed = salsa_box(recipient_public, sender_secret)
        .encrypt(&crypto_box::Nonce::from(nonce.to_bytes()), padded.as_slice())
        .map_err(|_| Error::Crypto("crypto_box seal failed".to_string()));
    padded.zeroize();
    sealed
}

/// Opens and unpads a sealed frame, or `None` on MAC failure.
pub fn decrypt(
    ciphertext: &[u8],
    nonce: &Nonce,
    sender_public: &X25519PublicKey,
    recipient_secret: &X25519Secret,
) -> Option<zeroize::Zeroizing<Vec<u8>>> {
    let mut padded = salsa_box(sender_public, recipient_secret)
        .decrypt(&crypto_box::Nonce::from(nonce.to_bytes()), ciphertext)
        .ok()?;
    secure_unpad(&mut padded)
}

/// [`decrypt`] trying up to four key combinations, covering messages that
/// crossed a rotation on either end. Attempt order: (current, current),
/// (previous, current), (current, previous), (previous, previous).
pub fn decrypt_with_fallback(
    ciphertext: &[u8],
    nonce: &Nonce,
    sender_public: &X25519PublicKey,
    recipient_secret: &X25519Secret,
    previous_sender_public: Option<&X25519PublicKey>,
    previous_recipient_secret: Option<&X25519Secret>,
) -> Option<zeroize::Zeroizing<Vec<u8>>> {
    let combinations = [
        (Some(sender_public), Some(recipient_secret)),
        (previous_sender_public, Some(recipient_secret)),
        (Some(sender_public), previous_recipient_secret),
        (previous_sender_public, previous_recipient_secret),
    ];

    for (public, secret) in combinations {
        let (Some(public), Some(secret)) = (public, secret) else {
            continue;
        };
        if let Some(plaintext) = decrypt(ciphertext, nonce, public, secret) {
            return Some(plaintext);
        }
    }

    None
}
