//! 256-bit comparison shared by the host and the kernel.
//!
//! A hash or target is 32 bytes read as four little-endian `u64` words;
//! word 3 (bytes 24..32) is the most significant. The kernel compares the
//! same value as eight `u32` words from index 7 down, which orders
//! identically.

use core::cmp::Ordering;

/// Split 32 bytes into four little-endian 64-bit words (index 3 most significant).
pub fn to_words(bytes: &[u8; 32]) -> [u64; 4] {
    let mut words = [0u64; 4];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(chunk);
        *word = u64::from_le_bytes(buf);
    }
    words
}

/// Compare two word arrays, most significant word first.
pub fn compare_words(a: &[u64; 4], b: &[u64; 4]) -> Ordering {
    for k in (0..4).rev() {
        match a[k].cmp(&b[k]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Three-way comparison of two 256-bit values.
pub fn compare_uint256(a: &[u8; 32], b: &[u8; 32]) -> Ordering {
    compare_words(&to_words(a), &to_words(b))
}

/// A hash qualifies when it does not exceed the target (ties qualify).
pub fn meets_target(hash: &[u8; 32], target: &[u8; 32]) -> bool {
    compare_uint256(target, hash) != Ordering::Less
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitive_types::U256;
    use rand::{Rng, SeedableRng};

    fn random_pair(rng: &mut impl Rng) -> ([u8; 32], [u8; 32]) {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        rng.fill(&mut a);
        rng.fill(&mut b);
        // Force shared high words on some pairs so the short-circuit gets exercised.
        let shared = rng.gen_range(0..=32);
        b[32 - shared..].copy_from_slice(&a[32 - shared..]);
        (a, b)
    }

    #[test]
    fn ordering_matches_little_endian_u256() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        for _ in 0..2_000 {
            let (a, b) = random_pair(&mut rng);
            let expected = U256::from_little_endian(&a).cmp(&U256::from_little_endian(&b));
            assert_eq!(compare_uint256(&a, &b), expected);
        }
    }

    #[test]
    fn comparison_is_antisymmetric_and_total() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(43);
        for _ in 0..1_000 {
            let (a, b) = random_pair(&mut rng);
            assert_eq!(compare_uint256(&a, &b), compare_uint256(&b, &a).reverse());
            assert!(meets_target(&a, &b) ^ (compare_uint256(&a, &b) == Ordering::Greater));
        }
    }

    #[test]
    fn equal_hash_meets_target() {
        let v = [0x5au8; 32];
        assert_eq!(compare_uint256(&v, &v), Ordering::Equal);
        assert!(meets_target(&v, &v));
    }

    #[test]
    fn most_significant_word_decides() {
        let mut small = [0xffu8; 32];
        small[31] = 0x00;
        let mut large = [0x00u8; 32];
        large[31] = 0x01;
        assert_eq!(compare_uint256(&small, &large), Ordering::Less);
        assert!(meets_target(&small, &large));
        assert!(!meets_target(&large, &small));
    }

    #[test]
    fn low_bytes_break_ties_only_when_high_words_match() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        a[0] = 2;
        b[0] = 1;
        assert_eq!(compare_uint256(&a, &b), Ordering::Greater);
        b[8] = 1;
        assert_eq!(compare_uint256(&a, &b), Ordering::Less);
    }
}
