//! 24-byte nonces with embedded freshness and per-peer replay protection.
//!
//! Layout: `[0..8)` big-endian millisecond timestamp, `[8..12)` big-endian
//! send counter, `[12..24)` CSPRNG tail. Validation admits a nonce only if
//! its timestamp is within the drift window and its counter strictly
//! exceeds the last counter accepted for that peer.

use crate::crypto::{fill_random, unix_ms};
use crate::error::Error;
use std::collections::HashMap;
use std::time::SystemTime;

pub const NONCE_LEN: usize = 24;

/// Maximum tolerated clock drift between sender and receiver.
pub const MAX_DRIFT_MS: u64 = 30_000;

/// A structured 24-byte nonce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    /// Parses a nonce, rejecting anything that is not exactly 24 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != NONCE_LEN {
            return None;
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(bytes);
        Some(Self(nonce))
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; NONCE_LEN] {
        self.0
    }

    pub fn timestamp_ms(&self) -> u64 {
        u64::from_be_bytes(self.0[0..8].try_into().expect("8-byte slice"))
    }

    pub fn counter(&self) -> u32 {
        u32::from_be_bytes(self.0[8..12].try_into().expect("4-byte slice"))
    }
}

/// Owns the process-wide send counter and per-peer acceptance state.
#[derive(Default)]
pub struct NonceManager {
    send_counter: u32,
    // peer -> last accepted counter, -1 before anything is accepted
    last_accepted: HashMap<String, i64>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produces the next send nonce.
    pub fn generate(&mut self) -> Result<Nonce, Error> {
        self.generate_at(SystemTime::now())
    }

    pub(crate) fn generate_at(&mut self, now: SystemTime) -> Result<Nonce, Error> {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[0..8].copy_from_slice(&unix_ms(now).to_be_bytes());
        nonce[8..12].copy_from_slice(&self.send_counter.to_be_bytes());
        fill_random(&mut nonce[12..])?;

        self.send_counter = self.send_counter.wrapping_add(1);
        Ok(Nonce(nonce))
    }

    /// Accepts or rejects a received nonce for `peer`.
    pub fn validate(&mut self, peer: &str, nonce: &[u8]) -> bool {
        self.validate_at(peer, nonce, SystemTime::now())
    }

    pub(crate) fn validate_at(&mut self, peer: &str, nonce: &[u8], now: SystemTime) -> bool {
        self.accept_at(peer, nonce, now).is_ok()
    }

    /// [`Self::validate`], reporting why a nonce was turned away: a
    /// malformed frame is a wire error, staleness and counter reuse are
    /// replay rejections.
    pub fn accept(&mut self, peer: &str, nonce: &[u8]) -> Result<(), Error> {
        self.accept_at(peer, nonce, SystemTime::now())
    }

    pub(crate) fn accept_at(
        &mut self,
        peer: &str,
        nonce: &[u8],
        now: SystemTime,
    ) -> Result<(), Error> {
        let Some(nonce) = Nonce::from_slice(nonce) else {
            return Err(Error::Wire(format!("nonce must be {NONCE_LEN} bytes")));
        };

        let now_ms = unix_ms(now);
        if now_ms.abs_diff(nonce.timestamp_ms()) > MAX_DRIFT_MS {
            tracing::warn!(peer, "rejecting stale nonce");
            return Err(Error::Replay(format!("stale nonce from {peer}")));
        }

        let last = self.last_accepted.entry(peer.to_string()).or_insert(-1);
        if i64::from(nonce.counter()) <= *last {
            tracing::warn!(peer, counter = nonce.counter(), "rejecting replayed nonce");
            return Err(Error::Replay(format!(
                "counter {} already seen from {peer}",
                nonce.counter()
            )));
        }

        *last = i64::from(nonce.counter());
        Ok(())
    }

    /// Forgets the acceptance state for a departed peer.
    pub fn remove_peer(&mut self, peer: &str) {
        self.last_accepted.remove(peer);
    }
}
