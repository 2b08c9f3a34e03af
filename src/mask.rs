//! Client-to-server payload masking (RFC 6455 §5.3).

use rand::rngs::OsRng;
use rand::RngCore;

/// Generate a fresh masking key for a client frame.
///
/// RFC 6455 §5.3 requires keys from a strong source of entropy; this uses
/// the operating system CSPRNG.
#[inline]
pub fn generate_mask() -> [u8; 4] {
    let mut key = [0u8; 4];
    OsRng.fill_bytes(&mut key);
    key
}

/// XOR `data` in place with the repeating 4-byte mask.
///
/// Used both for masking (client writes) and unmasking (server reads).
/// Processes eight bytes per step where possible; the result is identical
/// to the naive byte loop.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    let mask_u64 = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let word = u64::from_ne_bytes(chunk.try_into().unwrap()) ^ mask_u64;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    for (i, b) in chunks.into_remainder().iter_mut().enumerate() {
        *b ^= mask[i & 3];
    }
}

/// XOR `data` in place, starting at byte `offset` of the mask rotation.
///
/// Lets a payload be masked or unmasked across multiple buffers: pass the
/// returned offset to the next call to continue the key rotation where
/// this one left off.
#[inline]
pub fn apply_mask_offset(data: &mut [u8], mask: [u8; 4], offset: usize) -> usize {
    let offset = offset & 3;
    let rotated = [
        mask[offset],
        mask[(offset + 1) & 3],
        mask[(offset + 2) & 3],
        mask[(offset + 3) & 3],
    ];
    apply_mask(data, rotated);
    (offset + data.len()) & 3
}
