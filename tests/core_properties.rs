//! Property-based tests for the core laws: padding round-trips, SAS
//! symmetry, fingerprint determinism, and nonce monotonicity hold for all
//! inputs, not just the examples the unit tests pick.

use ciphermesh::{
    DoubleRatchet, NonceManager, X25519PublicKey, X25519Secret, fingerprint, padding, sas_code,
};
use proptest::prelude::*;

/// Strategy for plaintexts across several buckets plus the unpadded tail.
fn arbitrary_plaintext() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..512),
        prop::collection::vec(any::<u8>(), 2040..2060),
        prop::collection::vec(any::<u8>(), 32_760..32_780),
    ]
}

fn arbitrary_key() -> impl Strategy<Value = X25519PublicKey> {
    any::<[u8; 32]>().prop_map(X25519PublicKey::from)
}

#[test]
fn prop_pad_unpad_roundtrip() {
    proptest!(|(plaintext in arbitrary_plaintext())| {
        let padded = padding::pad(&plaintext).unwrap();
        prop_assert!(padded.len() >= 2 + plaintext.len());
        prop_assert_eq!(padding::unpad(&padded).unwrap(), plaintext);
    });
}

#[test]
fn prop_padded_lengths_are_bucketized() {
    let buckets = [128usize, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768];
    proptest!(|(plaintext in prop::collection::vec(any::<u8>(), 0..8192))| {
        let padded = padding::pad(&plaintext).unwrap();
        prop_assert!(buckets.contains(&padded.len()));
    });
}

#[test]
fn prop_unpad_never_panics() {
    proptest!(|(garbage in prop::collection::vec(any::<u8>(), 0..256))| {
        let _ = padding::unpad(&garbage);
    });
}

#[test]
fn prop_sas_is_symmetric_and_six_digits() {
    proptest!(|(a in arbitrary_key(), b in arbitrary_key())| {
        let code = sas_code(&a, &b);
        prop_assert_eq!(&code, &sas_code(&b, &a));
        prop_assert_eq!(code.len(), 6);
        prop_assert!(code.chars().all(|c| c.is_ascii_digit()));
    });
}

#[test]
fn prop_fingerprint_is_deterministic() {
    proptest!(|(key in arbitrary_key())| {
        let code = fingerprint(&key);
        prop_assert_eq!(&code, &fingerprint(&key));

        let quartets: Vec<&str> = code.split(':').collect();
        prop_assert_eq!(quartets.len(), 4);
        for quartet in quartets {
            prop_assert_eq!(quartet.len(), 4);
        }
    });
}

#[test]
fn prop_nonce_validator_accepts_monotonic_sequences() {
    proptest!(|(count in 1usize..40)| {
        let mut sender = NonceManager::new();
        let mut receiver = NonceManager::new();

        let nonces: Vec<_> = (0..count).map(|_| sender.generate().unwrap()).collect();

        // In-order: every nonce lands.
        for nonce in &nonces {
            prop_assert!(receiver.validate("peer", nonce.as_bytes()));
        }
        // Anything at or below the high-water mark is now rejected.
        for nonce in &nonces {
            prop_assert!(!receiver.validate("peer", nonce.as_bytes()));
        }
    });
}

#[test]
fn prop_ratchet_delivers_arbitrary_payloads_in_order() {
    proptest!(|(payloads in prop::collection::vec(
        prop::collection::vec(any::<u8>(), 0..200),
        1..8,
    ))| {
        let alice_static = X25519Secret::generate().unwrap();
        let bob_static = X25519Secret::generate().unwrap();
        let mut alice = DoubleRatchet::initialize(
            "alice",
            "bob",
            &alice_static,
            &bob_static.public_key(),
        )
        .unwrap();
        let mut bob = DoubleRatchet::initialize(
            "bob",
            "alice",
            &bob_static,
            &alice_static.public_key(),
        )
        .unwrap();

        for payload in &payloads {
            let message = alice.encrypt(payload).unwrap();
            let plaintext = bob.decrypt(&message).unwrap();
            prop_assert_eq!(plaintext.as_slice(), payload.as_slice());
        }
    });
}
