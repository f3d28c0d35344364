//! Long-term X25519 identity with graceful rotation.
//!
//! Rotation keeps the outgoing generation alive for a short grace window so
//! in-flight messages sealed to the old key still decrypt. The grace
//! deadline is enforced lazily at access time; there is no background
//! timer, and expiry's only effect is zeroing the previous secret.

use crate::error::Error;
use crate::types::{X25519PublicKey, X25519Secret};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// How long a rotated-out identity key stays usable for decryption.
pub const ROTATION_GRACE: Duration = Duration::from_secs(30);

/// Uppercase colon-grouped hex of the first 8 bytes of SHA-256(key).
pub fn fingerprint(public_key: &X25519PublicKey) -> String {
    let digest = Sha256::digest(public_key.as_bytes());
    digest[..8]
        .chunks(2)
        .map(|pair| format!("{:02X}{:02X}", pair[0], pair[1]))
        .collect::<Vec<_>>()
        .join(":")
}

struct PreviousKey {
    secret: X25519Secret,
    public: X25519PublicKey,
    expires_at: SystemTime,
}

/// The long-term identity keypair, plus at most one previous generation
/// inside its grace window.
pub struct Identity {
    secret: X25519Secret,
    public: X25519PublicKey,
    previous: Option<PreviousKey>,
}

impl Identity {
    pub fn new() -> Result<Self, Error> {
        let secret = X25519Secret::generate()?;
        let public = secret.public_key();
        Ok(Self {
            secret,
            public,
            previous: None,
        })
    }

    pub fn public(&self) -> X25519PublicKey {
        self.public
    }

    /// Fingerprint of the current public key.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public)
    }

    pub(crate) fn secret(&self) -> &X25519Secret {
        &self.secret
    }

    /// Replaces the current keypair, retaining the old one for the grace
    /// window. Any prior previous generation is wiped immediately.
    pub fn rotate(&mut self) -> Result<(), Error> {
        self.rotate_at(SystemTime::now())
    }

    pub(crate) fn rotate_at(&mut self, now: SystemTime) -> Result<(), Error> {
        let fresh = X25519Secret::generate()?;
        let fresh_public = fresh.public_key();

        let outgoing = std::mem::replace(&mut self.secret, fresh);
        let outgoing_public = std::mem::replace(&mut self.public, fresh_public);

        // Dropping the old `previous` (if any) zeroizes it.
        self.previous = Some(PreviousKey {
            secret: outgoing,
            public: outgoing_public,
            expires_at: now + ROTATION_GRACE,
        });

        tracing::info!(fingerprint = %self.fingerprint(), "rotated identity key");
        Ok(())
    }

    /// Wipes the previous generation once its grace window has passed.
    pub(crate) fn expire_previous(&mut self) {
        self.expire_previous_at(SystemTime::now());
    }

    pub(crate) fn expire_previous_at(&mut self, now: SystemTime) {
        if let Some(previous) = &self.previous {
            if now >= previous.expires_at {
                self.previous = None;
            }
        }
    }

    /// The previous generation, if any. Call [`Self::expire_previous`]
    /// first so an aged-out key is not handed back.
    pub(crate) fn previous_keys(&self) -> Option<(&X25519Secret, X25519PublicKey)> {
        self.previous
            .as_ref()
            .map(|previous| (&previous.secret, previous.public))
    }

    /// Tears the identity down, wiping all secrets.
    pub fn destroy(mut self) {
        self.zeroize();
    }

    pub(crate) fn from_parts(secret: X25519Secret) -> Self {
        let public = secret.public_key();
        Self {
            secret,
            public,
            previous: None,
        }
    }
}

impl Zeroize for Identity {
    fn zeroize(&mut self) {
        self.secret.zeroize();
        if let Some(previous) = &mut self.previous {
            previous.secret.zeroize();
        }
        self.previous = None;
    }
}

impl Drop for Identity {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl ZeroizeOnDrop for Identity {}
