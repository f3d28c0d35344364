//! Shared primitives: CSPRNG access, BLAKE2b aliases, secretbox wrappers,
//! and the base64 serde adapters used by every persisted structure.

use crate::error::Error;
use blake2::digest::consts::{U32, U64};
use blake2::{Blake2b, Blake2bMac, Digest};
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};
use rand::TryRngCore;
use rand::rngs::OsRng;

pub(crate) type Blake2b256 = Blake2b<U32>;
pub(crate) type Blake2bMac256 = Blake2bMac<U32>;
pub(crate) type Blake2bMac512 = Blake2bMac<U64>;

/// Fills `buf` from the OS CSPRNG. RNG failure is fatal for the caller.
pub(crate) fn fill_random(buf: &mut [u8]) -> Result<(), Error> {
    OsRng.try_fill_bytes(buf).map_err(|_| Error::Random)
}

/// Generates a fresh 32-byte seed for key material.
pub(crate) fn generate_random_seed() -> Result<[u8; 32], Error> {
    let mut seed = [0u8; 32];
    fill_random(&mut seed)?;
    Ok(seed)
}

/// Unkeyed BLAKE2b-256 over `data`.
pub(crate) fn blake2b_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// `crypto_secretbox_easy`: XSalsa20-Poly1305 under a single-use key.
pub(crate) fn secretbox_seal(
    key: &[u8; 32],
    nonce: &[u8; 24],
    plaintext: &[u8],
) -> Result<Vec<u8>, Error> {
    let cipher = XSalsa20Poly1305::new(&Key::from(*key));
    cipher
        .encrypt(&Nonce::from(*nonce), plaintext)
        .map_err(|_| Error::Crypto("Message encryption failed".to_string()))
}

/// `crypto_secretbox_open_easy`: returns `None` on MAC failure.
pub(crate) fn secretbox_open(
    key: &[u8; 32],
    nonce: &[u8; 24],
    ciphertext: &[u8],
) -> Option<Vec<u8>> {
    let cipher = XSalsa20Poly1305::new(&Key::from(*key));
    cipher.decrypt(&Nonce::from(*nonce), ciphertext).ok()
}

/// Serde adapter encoding `Vec<u8>` fields as standard base64 strings.
pub(crate) mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Like [`b64`], for optional fields.
pub(crate) mod b64_opt {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Milliseconds since the Unix epoch for `t`.
pub(crate) fn unix_ms(t: std::time::SystemTime) -> u64 {
    t.duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Copies a decoded buffer into a fixed array, validating length.
pub(crate) fn decode_exact<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N], Error> {
    if bytes.len() != N {
        return Err(Error::Serde(format!(
            "Invalid {what} length: expected {N}, got {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}
