//! BLAKE2s-256 compression function.
//!
//! Only the pieces the search needs live here: the compression function, the
//! parameter block for an unkeyed 32-byte digest, and helpers to move between
//! bytes and little-endian words. Whole-message hashing goes through the
//! `blake2` crate (see [`crate::reference`]), which keeps an independent
//! implementation around to check this one against.

/// BLAKE2s block size in bytes.
pub const BLOCK_SIZE: usize = 64;

/// Digest length in bytes.
pub const OUT_BYTES: usize = 32;

/// Number of mixing rounds.
pub const ROUNDS: usize = 10;

/// Initialization vector (same constants as SHA-256).
pub const IV: [u32; 8] = [
    0x6A09_E667,
    0xBB67_AE85,
    0x3C6E_F372,
    0xA54F_F53A,
    0x510E_527F,
    0x9B05_688C,
    0x1F83_D9AB,
    0x5BE0_CD19,
];

/// Message word permutation, one row per round.
pub const SIGMA: [[usize; 16]; ROUNDS] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
    [14, 10, 4, 8, 9, 15, 13, 6, 1, 12, 0, 2, 11, 7, 5, 3],
    [11, 8, 12, 0, 5, 2, 15, 13, 10, 14, 3, 6, 7, 1, 9, 4],
    [7, 9, 3, 1, 13, 12, 11, 14, 2, 6, 5, 10, 4, 0, 15, 8],
    [9, 0, 5, 7, 2, 4, 10, 15, 14, 1, 11, 12, 6, 8, 3, 13],
    [2, 12, 6, 10, 0, 11, 8, 3, 4, 13, 7, 5, 15, 14, 1, 9],
    [12, 5, 1, 15, 14, 13, 4, 10, 0, 7, 6, 3, 9, 2, 8, 11],
    [13, 11, 7, 14, 12, 1, 3, 9, 5, 0, 15, 4, 8, 6, 2, 10],
    [6, 15, 14, 9, 11, 3, 0, 8, 12, 2, 13, 7, 1, 4, 10, 5],
    [10, 2, 8, 4, 7, 6, 1, 5, 15, 11, 9, 14, 3, 12, 13, 0],
];

/// Column and diagonal index quadruples for one round, in G order.
const LANES: [[usize; 4]; 8] = [
    [0, 4, 8, 12],
    [1, 5, 9, 13],
    [2, 6, 10, 14],
    [3, 7, 11, 15],
    [0, 5, 10, 15],
    [1, 6, 11, 12],
    [2, 7, 8, 13],
    [3, 4, 9, 14],
];

/// Chaining value for an unkeyed hash with a 32-byte digest
/// (digest length 32, key length 0, fanout 1, depth 1).
pub fn parameter_iv() -> [u32; 8] {
    let mut h = IV;
    h[0] ^= 0x0101_0000 ^ OUT_BYTES as u32;
    h
}

#[inline(always)]
fn g(v: &mut [u32; 16], [a, b, c, d]: [usize; 4], x: u32, y: u32) {
    v[a] = v[a].wrapping_add(v[b]).wrapping_add(x);
    v[d] = (v[d] ^ v[a]).rotate_right(16);
    v[c] = v[c].wrapping_add(v[d]);
    v[b] = (v[b] ^ v[c]).rotate_right(12);
    v[a] = v[a].wrapping_add(v[b]).wrapping_add(y);
    v[d] = (v[d] ^ v[a]).rotate_right(8);
    v[c] = v[c].wrapping_add(v[d]);
    v[b] = (v[b] ^ v[c]).rotate_right(7);
}

#[inline(always)]
fn round(v: &mut [u32; 16], m: &[u32; 16], s: &[usize; 16]) {
    for (i, lane) in LANES.iter().enumerate() {
        g(v, *lane, m[s[2 * i]], m[s[2 * i + 1]]);
    }
}

/// Compress one block into the chaining value `h`.
///
/// `t` is the number of message bytes consumed so far, including this block.
/// `last` marks the final block of the message.
pub fn compress(h: &mut [u32; 8], m: &[u32; 16], t: u64, last: bool) {
    let mut v = [0u32; 16];
    v[..8].copy_from_slice(h);
    v[8..].copy_from_slice(&IV);
    v[12] ^= t as u32;
    v[13] ^= (t >> 32) as u32;
    if last {
        v[14] = !v[14];
    }

    for s in SIGMA.iter() {
        round(&mut v, m, s);
    }

    for i in 0..8 {
        h[i] ^= v[i] ^ v[i + 8];
    }
}

/// Load a 64-byte block as sixteen little-endian words.
///
/// Shorter input is treated as zero-padded.
pub fn load_block(bytes: &[u8]) -> [u32; 16] {
    let mut m = [0u32; 16];
    for (word, chunk) in m.iter_mut().zip(bytes.chunks(4)) {
        let mut buf = [0u8; 4];
        buf[..chunk.len()].copy_from_slice(chunk);
        *word = u32::from_le_bytes(buf);
    }
    m
}

/// Serialize a chaining value as the 32-byte digest.
pub fn state_to_bytes(h: &[u32; 8]) -> [u8; OUT_BYTES] {
    let mut out = [0u8; OUT_BYTES];
    for (chunk, word) in out.chunks_exact_mut(4).zip(h.iter()) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
}
