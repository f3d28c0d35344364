//! CipherMesh core: the per-peer secure channel shared by the relay and
//! P2P deployments.
//!
//! The relay only ever forwards opaque payloads; everything that matters
//! lives here: identity lifecycle, Double-Ratchet sessions, length-hiding
//! padding, anti-replay, the static-box offline fallback, TOFU trust with
//! SAS verification, a deniable symmetric path, wire validation, and
//! passphrase-encrypted persistence.

mod config;
pub use config::{CoreConfig, DEFAULT_PORT, LogLevel};

mod crypto;

mod error;
pub use error::Error;

mod types;
pub use types::{X25519PublicKey, X25519Secret};

mod identity;
pub use identity::{Identity, ROTATION_GRACE, fingerprint};

mod nonce;
pub use nonce::{MAX_DRIFT_MS, NONCE_LEN, Nonce, NonceManager};

pub mod padding;

pub mod static_box;

mod deniable;
pub use deniable::DeniableChannel;

mod ratchet;
pub use ratchet::{DoubleRatchet, MAX_SKIP, RatchetMessage, SKIPPED_KEY_TTL};

mod registry;
pub use registry::{HandshakeRegistry, PREVIOUS_KEY_GRACE};

mod trust;
pub use trust::{PeerRecord, TrustCheck, TrustStore, sas_code};

mod vault;
pub use vault::{SALT_LEN, StateVault};

mod persist;
pub use persist::{RatchetSnapshot, SessionState};

mod session;
pub use session::Session;

pub mod wire;
