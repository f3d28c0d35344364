use crate::types::{X25519PublicKey, X25519Secret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Mutable core of a per-peer ratchet.
///
/// Cloned wholesale at the top of every decrypt so failed attempts can
/// restore the pre-call state; both copies wipe on drop.
#[derive(Clone)]
pub(crate) struct RatchetState {
    pub(crate) root_key: Box<[u8; 32]>,

    pub(crate) send_chain_key: Option<Box<[u8; 32]>>,
    pub(crate) recv_chain_key: Option<Box<[u8; 32]>>,

    pub(crate) send_counter: u32,
    pub(crate) recv_counter: u32,
    pub(crate) previous_send_count: u32,

    // Own ephemeral pair. The responder bootstraps with a copy of its
    // static secret and no public half until its first send ratchet.
    pub(crate) my_eph_secret: Option<X25519Secret>,
    pub(crate) my_eph_public: Option<X25519PublicKey>,

    pub(crate) peer_eph_public: Option<X25519PublicKey>,

    pub(crate) initialized: bool,
    pub(crate) need_send_ratchet: bool,
}

impl Zeroize for RatchetState {
    fn zeroize(&mut self) {
        self.root_key.zeroize();
        if let Some(key) = self.send_chain_key.as_mut() {
            key.zeroize();
        }
        if let Some(key) = self.recv_chain_key.as_mut() {
            key.zeroize();
        }
        if let Some(secret) = self.my_eph_secret.as_mut() {
            secret.zeroize();
        }
        self.send_chain_key = None;
        self.recv_chain_key = None;
        self.my_eph_secret = None;
    }
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl ZeroizeOnDrop for RatchetState {}
