use crate::nonce::Nonce;
use crate::types::X25519PublicKey;

/// One encrypted ratchet frame as it travels inside a wire envelope.
///
/// `counter` numbers the message within the sender's current chain;
/// `previous_counter` is the length of the chain before the sender's last
/// DH ratchet step, letting the receiver close out the old chain.
#[derive(Clone)]
pub struct RatchetMessage {
    pub ciphertext: Vec<u8>,
    pub nonce: Nonce,
    pub ephemeral_public: X25519PublicKey,
    pub counter: u32,
    pub previous_counter: u32,
}
