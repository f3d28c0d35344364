//! Bucketized length hiding.
//!
//! A padded frame is `[0..2)` big-endian original length, the plaintext,
//! then random fill up to the smallest bucket that holds both. Frames
//! larger than the top bucket travel unpadded (prefix + plaintext only).

use crate::crypto::fill_random;
use crate::error::Error;
use zeroize::{Zeroize, Zeroizing};

const BUCKETS: [usize; 9] = [128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768];

/// Largest plaintext representable in the 2-byte length prefix.
pub const MAX_PLAINTEXT_LEN: usize = u16::MAX as usize;

/// Pads `plaintext` into its length bucket with CSPRNG fill.
pub fn pad(plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    if plaintext.len() > MAX_PLAINTEXT_LEN {
        return Err(Error::Protocol(format!(
            "Plaintext too large to pad: {} bytes",
            plaintext.len()
        )));
    }

    let used = 2 + plaintext.len();
    let total = BUCKETS
        .iter()
        .copied()
        .find(|&bucket| bucket >= used)
        .unwrap_or(used);

    let mut padded = vec![0u8; total];
    padded[0..2].copy_from_slice(&(plaintext.len() as u16).to_be_bytes());
    padded[2..used].copy_from_slice(plaintext);
    fill_random(&mut padded[used..])?;

    Ok(padded)
}

/// Recovers the plaintext, or `None` if the frame is malformed.
pub fn unpad(padded: &[u8]) -> Option<Vec<u8>> {
    if padded.len() < 2 {
        return None;
    }

    let declared = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if declared + 2 > padded.len() {
        return None;
    }

    Some(padded[2..2 + declared].to_vec())
}

/// [`unpad`] into a wipe-on-drop buffer; the input frame is zeroed whether
/// or not it parses.
pub fn secure_unpad(padded: &mut [u8]) -> Option<Zeroizing<Vec<u8>>> {
    let plaintext = unpad(padded).map(Zeroizing::new);
    padded.zeroize();
    plaintext
}
