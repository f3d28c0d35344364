#[macro_use]
extern crate afl;

use ciphermesh::{DoubleRatchet, Nonce, RatchetMessage, X25519PublicKey, X25519Secret};

// The victim: a responder-side ratchet fed attacker-controlled frames.
fn get_ratchet() -> DoubleRatchet {
    let my_static = X25519Secret::generate().expect("setup failed");
    let peer_static = X25519Secret::generate().expect("setup failed");

    DoubleRatchet::initialize("victim", "attacker", &my_static, &peer_static.public_key())
        .expect("setup failed")
}

fn main() {
    let mut ratchet = get_ratchet();

    fuzz!(|data: &[u8]| {
        if data.len() < 64 {
            return;
        }

        let nonce = Nonce::from_slice(&data[0..24]).expect("24-byte slice");
        let mut ephemeral = [0u8; 32];
        ephemeral.copy_from_slice(&data[24..56]);
        let counter = u32::from_be_bytes([data[56], data[57], data[58], data[59]]);
        let previous_counter = u32::from_be_bytes([data[60], data[61], data[62], data[63]]);

        let message = RatchetMessage {
            ciphertext: data[64..].to_vec(),
            nonce,
            ephemeral_public: X25519PublicKey::from(ephemeral),
            counter: counter % 256,
            previous_counter: previous_counter % 256,
        };

        let _ = ratchet.decrypt(&message);
    });
}
