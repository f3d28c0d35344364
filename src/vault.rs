//! Passphrase-encrypted persistence of session state.
//!
//! The envelope on disk is `{ salt, nonce, ciphertext }`, all base64:
//! ciphertext is a secretbox of the serialized state under a KEK derived
//! with Argon2id (interactive cost). A failed load (wrong passphrase,
//! corruption, missing file) degrades to `None` so the controller can
//! start fresh.

use crate::crypto::{fill_random, secretbox_open, secretbox_seal};
use crate::error::Error;
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

pub const SALT_LEN: usize = 16;

// libsodium's crypto_pwhash interactive limits.
const ARGON2_MEM_KIB: u32 = 64 * 1024;
const ARGON2_PASSES: u32 = 2;
const ARGON2_LANES: u32 = 1;

const STATE_SUBDIR: &str = "state";
const STATE_FILE: &str = "session-state.enc.json";

#[derive(Serialize, Deserialize)]
struct VaultEnvelope {
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// Encrypted state file under `.ciphermesh/state/`.
pub struct StateVault {
    path: PathBuf,
}

impl StateVault {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            path: base_dir.as_ref().join(STATE_SUBDIR).join(STATE_FILE),
        }
    }

    /// Derives the key-encryption key, generating a fresh salt when none
    /// is supplied. The KEK wipes on drop.
    pub fn derive_kek(
        passphrase: &str,
        salt: Option<[u8; SALT_LEN]>,
    ) -> Result<(Zeroizing<[u8; 32]>, [u8; SALT_LEN]), Error> {
        let salt = match salt {
            Some(salt) => salt,
            None => {
                let mut salt = [0u8; SALT_LEN];
                fill_random(&mut salt)?;
                salt
            }
        };

        let params = Params::new(ARGON2_MEM_KIB, ARGON2_PASSES, ARGON2_LANES, Some(32))
            .map_err(|err| Error::Vault(format!("bad Argon2 parameters: {err}")))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut kek = Zeroizing::new([0u8; 32]);
        argon2
            .hash_password_into(passphrase.as_bytes(), &salt, &mut kek[..])
            .map_err(|err| Error::Vault(format!("KEK derivation failed: {err}")))?;

        Ok((kek, salt))
    }

    /// Seals `data` under `kek` and writes the envelope.
    pub fn save<T: Serialize>(
        &self,
        data: &T,
        kek: &[u8; 32],
        salt: &[u8; SALT_LEN],
    ) -> Result<(), Error> {
        let plaintext = Zeroizing::new(serde_json::to_vec(data)?);

        let mut nonce = [0u8; 24];
        fill_random(&mut nonce)?;
        let ciphertext = secretbox_seal(kek, &nonce, &plaintext)?;

        let envelope = VaultEnvelope {
            salt: STANDARD.encode(salt),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string(&envelope)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms)?;
        }

        Ok(())
    }

    /// Re-derives the KEK from the stored salt and opens the envelope.
    pub fn load<T: DeserializeOwned>(&self, passphrase: &str) -> Option<T> {
        let content = fs::read_to_string(&self.path).ok()?;
        let envelope: VaultEnvelope = serde_json::from_str(&content).ok()?;

        let salt: [u8; SALT_LEN] = STANDARD
            .decode(envelope.salt)
            .ok()?
            .try_into()
            .ok()?;
        let nonce: [u8; 24] = STANDARD
            .decode(envelope.nonce)
            .ok()?
            .try_into()
            .ok()?;
        let ciphertext = STANDARD.decode(envelope.ciphertext).ok()?;

        let (kek, _) = Self::derive_kek(passphrase, Some(salt)).ok()?;
        let plaintext = Zeroizing::new(secretbox_open(&kek, &nonce, &ciphertext)?);

        serde_json::from_slice(&plaintext).ok()
    }

    pub fn has_state(&self) -> bool {
        self.path.exists()
    }

    /// Overwrites the envelope with zeros, then unlinks it.
    pub fn clear(&self) -> Result<(), Error> {
        if !self.path.exists() {
            return Ok(());
        }

        let len = fs::metadata(&self.path)?.len() as usize;
        fs::write(&self.path, vec![0u8; len])?;
        fs::remove_file(&self.path)?;
        Ok(())
    }
}
