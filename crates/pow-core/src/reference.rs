//! Reference hasher.
//!
//! Hashes the template with the nonce embedded using the stock `blake2`
//! implementation, independent of the mid-state path in this crate. Used to
//! verify every candidate a backend reports and as the oracle in tests.

use crate::compare::{compare_uint256, meets_target};
use crate::template::{MessageTemplate, NonceSlot, NONCE_SIZE};
use crate::target::Target;
use blake2::{Blake2s256, Digest};
use core::cmp::Ordering;

/// BLAKE2s-256 of the template with `nonce` in `slot`.
pub fn hash_nonce(template: &MessageTemplate, slot: NonceSlot, nonce: u64) -> [u8; 32] {
    let bytes = template.as_bytes();
    let mut hasher = Blake2s256::new();
    match slot {
        NonceSlot::Leading => {
            hasher.update(nonce.to_le_bytes());
            hasher.update(&bytes[NONCE_SIZE..]);
        }
        NonceSlot::Trailing => {
            hasher.update(&bytes[..bytes.len() - NONCE_SIZE]);
            hasher.update(nonce.to_le_bytes());
        }
    }
    hasher.finalize().into()
}

/// `compare(target, hash(nonce))`; anything but `Less` is a hit.
pub fn check_nonce(
    template: &MessageTemplate,
    slot: NonceSlot,
    nonce: u64,
    target: &Target,
) -> Ordering {
    compare_uint256(target.as_bytes(), &hash_nonce(template, slot, nonce))
}

/// Sequentially scan lane `lane` of the batch starting at `start_nonce` and
/// return the first qualifying nonce.
pub fn search_lane(
    template: &MessageTemplate,
    slot: NonceSlot,
    target: &Target,
    start_nonce: u64,
    lanes_per_item: u64,
    lane: u64,
) -> Option<u64> {
    let first = start_nonce.wrapping_add(lane.wrapping_mul(lanes_per_item));
    (0..lanes_per_item)
        .map(|i| first.wrapping_add(i))
        .find(|&nonce| meets_target(&hash_nonce(template, slot, nonce), target.as_bytes()))
}
