//! Trust-on-first-use identity store.
//!
//! Records are keyed by lowercase nickname and persisted as JSON under
//! `.ciphermesh/trusted-peers.json`. A key observed for a known nickname
//! that differs from the pinned one is never an error, only a warning the
//! user resolves by re-trusting or by out-of-band SAS verification.

use crate::crypto::{Blake2b256, unix_ms};
use crate::error::Error;
use crate::identity::fingerprint;
use crate::types::X25519PublicKey;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use blake2::Digest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const TRUST_FILE: &str = "trusted-peers.json";
const SAS_CONTEXT: &[u8] = b"CipherMesh-SAS-v1";

/// Outcome of checking an observed peer key against the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrustCheck {
    /// Nickname never seen before.
    NewPeer,
    /// Key matches the pinned record.
    Trusted,
    /// Key differs from an unverified record.
    Mismatch,
    /// Key differs from a record the user explicitly verified.
    VerifiedMismatch,
}

/// One pinned peer identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub fingerprint: String,
    pub public_key: String,
    pub first_seen: u64,
    pub last_seen: u64,
    pub verified: bool,
}

/// TOFU store backed by a single-writer JSON file.
pub struct TrustStore {
    path: PathBuf,
    records: HashMap<String, PeerRecord>,
}

impl TrustStore {
    /// Opens the store under `base_dir`, starting empty if no file exists.
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self, Error> {
        let path = base_dir.as_ref().join(TRUST_FILE);

        let records = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|err| Error::Trust(format!("corrupt trust store: {err}")))?
        } else {
            HashMap::new()
        };

        Ok(Self { path, records })
    }

    /// `~/.ciphermesh`, the default persistence directory.
    pub fn default_base_dir() -> Result<PathBuf, Error> {
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".ciphermesh"))
            .ok_or_else(|| Error::Trust("cannot determine home directory".to_string()))
    }

    /// Compares an observed key against the pinned record for `nickname`.
    /// A match refreshes `lastSeen`.
    pub fn check(&mut self, nickname: &str, public: &X25519PublicKey) -> TrustCheck {
        let key = nickname.to_lowercase();
        let encoded = STANDARD.encode(public.as_bytes());

        let check = match self.records.get_mut(&key) {
            None => TrustCheck::NewPeer,
            Some(record) if record.public_key == encoded => {
                record.last_seen = unix_ms(SystemTime::now());
                TrustCheck::Trusted
            }
            Some(record) if record.verified => {
                tracing::warn!(nickname = %key, "verified peer presented a different key");
                TrustCheck::VerifiedMismatch
            }
            Some(_) => {
                tracing::warn!(nickname = %key, "peer presented a different key");
                TrustCheck::Mismatch
            }
        };

        if check == TrustCheck::Trusted {
            self.persist_best_effort();
        }
        check
    }

    /// Pins a first-seen key with `verified = false`.
    pub fn record(&mut self, nickname: &str, public: &X25519PublicKey) -> Result<(), Error> {
        let now = unix_ms(SystemTime::now());
        self.records.insert(
            nickname.to_lowercase(),
            PeerRecord {
                fingerprint: fingerprint(public),
                public_key: STANDARD.encode(public.as_bytes()),
                first_seen: now,
                last_seen: now,
                verified: false,
            },
        );
        self.save()
    }

    /// User-approved replacement: the new key starts unverified.
    pub fn update(&mut self, nickname: &str, public: &X25519PublicKey) -> Result<(), Error> {
        self.replace_key(nickname, public, false)
    }

    /// Authenticated in-channel rotation: verification status carries over.
    pub fn auto_update(&mut self, nickname: &str, public: &X25519PublicKey) -> Result<(), Error> {
        self.replace_key(nickname, public, true)
    }

    fn replace_key(
        &mut self,
        nickname: &str,
        public: &X25519PublicKey,
        preserve_verified: bool,
    ) -> Result<(), Error> {
        let key = nickname.to_lowercase();
        let now = unix_ms(SystemTime::now());

        match self.records.get_mut(&key) {
            Some(record) => {
                record.fingerprint = fingerprint(public);
                record.public_key = STANDARD.encode(public.as_bytes());
                record.last_seen = now;
                if !preserve_verified {
                    record.verified = false;
                }
            }
            None => {
                self.records.insert(
                    key,
                    PeerRecord {
                        fingerprint: fingerprint(public),
                        public_key: STANDARD.encode(public.as_bytes()),
                        first_seen: now,
                        last_seen: now,
                        verified: false,
                    },
                );
            }
        }

        self.save()
    }

    /// Flags a record as SAS-verified.
    pub fn mark_verified(&mut self, nickname: &str) -> Result<(), Error> {
        let key = nickname.to_lowercase();
        let record = self
            .records
            .get_mut(&key)
            .ok_or_else(|| Error::Trust(format!("unknown peer: {key}")))?;
        record.verified = true;
        self.save()
    }

    pub fn get(&self, nickname: &str) -> Option<&PeerRecord> {
        self.records.get(&nickname.to_lowercase())
    }

    fn save(&self) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(&self.records)?;
        fs::write(&self.path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms)?;
        }

        Ok(())
    }

    fn persist_best_effort(&self) {
        if let Err(err) = self.save() {
            tracing::warn!(error = %err, "failed to persist trust store");
        }
    }
}

/// Short authentication string both endpoints derive identically:
/// BLAKE2b-256 over the lexicographically-ordered public keys plus a
/// domain separator, reduced to six decimal digits.
pub fn sas_code(a: &X25519PublicKey, b: &X25519PublicKey) -> String {
    let (first, second) = if a.as_bytes() <= b.as_bytes() {
        (a, b)
    } else {
        (b, a)
    };

    let mut hasher = Blake2b256::new();
    hasher.update(first.as_bytes());
    hasher.update(second.as_bytes());
    hasher.update(SAS_CONTEXT);
    let digest = hasher.finalize();

    let n = ((u32::from(digest[0]) << 16) | (u32::from(digest[1]) << 8) | u32::from(digest[2]))
        % 1_000_000;
    format!("{n:06}")
}
