#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! BLAKE2s proof-of-work core shared by every search backend.
//!
//! This crate provides:
//! - `compare`: the 256-bit comparator used identically on host and device
//! - `blake2s`: the compression function and permutation table
//! - `MessageTemplate`, `NonceSlot`, `Target`: validated inputs
//! - `JobContext`: mid-state and kernel constants, derived once per search
//! - `hash_from_nonce`: the per-nonce evaluation the kernel performs, on the host
//! - `reference`: whole-message hashing through the `blake2` crate, for verification

pub mod blake2s;
pub mod compare;
pub mod error;
pub mod reference;
pub mod target;
pub mod template;

pub use compare::{compare_uint256, meets_target};
pub use error::PowError;
pub use target::Target;
pub use template::{MessageTemplate, NonceSlot, MAX_TEMPLATE_LEN, MIN_TEMPLATE_LEN, NONCE_SIZE};

use blake2s::{compress, load_block, parameter_iv, state_to_bytes, BLOCK_SIZE};

/// Words per message block.
pub const BLOCK_WORDS: usize = BLOCK_SIZE / 4;

/// Precomputed constants for one search (template + slot + target).
///
/// Every block before the first one that holds nonce bytes is compressed once
/// into `midstate`. The remaining blocks form the variable region: their words
/// are kept with the nonce bytes zeroed, and each nonce trial ORs its bytes in
/// and recompresses only those blocks.
#[derive(Clone, Debug)]
pub struct JobContext {
    pub template: MessageTemplate,
    pub slot: NonceSlot,
    pub target: Target,

    pub midstate: [u32; 8],
    pub variable_words: Vec<u32>,
    /// Bytes already folded into `midstate`.
    pub counter_base: u32,
    /// Nonce position relative to the start of the variable region.
    pub nonce_offset: u32,
    pub message_len: u32,
}

impl JobContext {
    pub fn new(template: MessageTemplate, slot: NonceSlot, target: Target) -> Self {
        let len = template.len();
        let offset = slot.offset(len);
        let first_variable = offset / BLOCK_SIZE;

        let mut bytes = *template.padded();
        bytes[offset..offset + NONCE_SIZE].fill(0);

        let mut midstate = parameter_iv();
        for b in 0..first_variable {
            let m = load_block(&bytes[b * BLOCK_SIZE..(b + 1) * BLOCK_SIZE]);
            compress(&mut midstate, &m, ((b + 1) * BLOCK_SIZE) as u64, false);
        }

        let mut variable_words = Vec::with_capacity(BLOCK_WORDS * template.block_count());
        for b in first_variable..template.block_count() {
            variable_words.extend_from_slice(&load_block(
                &bytes[b * BLOCK_SIZE..(b + 1) * BLOCK_SIZE],
            ));
        }

        JobContext {
            midstate,
            variable_words,
            counter_base: (first_variable * BLOCK_SIZE) as u32,
            nonce_offset: (offset - first_variable * BLOCK_SIZE) as u32,
            message_len: len as u32,
            template,
            slot,
            target,
        }
    }

    /// Number of blocks recompressed per nonce.
    pub fn variable_blocks(&self) -> usize {
        self.variable_words.len() / BLOCK_WORDS
    }
}

/// OR the little-endian nonce bytes that fall inside variable block `block`.
fn splice_nonce(m: &mut [u32; BLOCK_WORDS], block: usize, nonce_offset: usize, nonce: &[u8; 8]) {
    for (j, byte) in nonce.iter().enumerate() {
        let pos = nonce_offset + j;
        if pos / BLOCK_SIZE != block {
            continue;
        }
        let within = pos % BLOCK_SIZE;
        m[within / 4] |= (*byte as u32) << (8 * (within % 4));
    }
}

/// Hash one nonce starting from the mid-state.
///
/// This is the algorithm the compute kernel runs per lane iteration; the CPU
/// backend uses it directly and the tests hold it against [`reference`].
pub fn hash_from_nonce(ctx: &JobContext, nonce: u64) -> [u8; 32] {
    let nonce_bytes = nonce.to_le_bytes();
    let blocks = ctx.variable_blocks();
    let mut h = ctx.midstate;

    for b in 0..blocks {
        let mut m = [0u32; BLOCK_WORDS];
        m.copy_from_slice(&ctx.variable_words[b * BLOCK_WORDS..(b + 1) * BLOCK_WORDS]);
        splice_nonce(&mut m, b, ctx.nonce_offset as usize, &nonce_bytes);

        let last = b + 1 == blocks;
        let t = if last {
            ctx.message_len
        } else {
            ctx.counter_base + ((b + 1) * BLOCK_SIZE) as u32
        };
        compress(&mut h, &m, t as u64, last);
    }

    state_to_bytes(&h)
}

/// Check a hash against the context's target.
pub fn is_valid_hash(ctx: &JobContext, hash: &[u8; 32]) -> bool {
    meets_target(hash, ctx.target.as_bytes())
}

/// Hash a nonce through the mid-state path and check it.
pub fn is_valid_nonce_for_context(ctx: &JobContext, nonce: u64) -> (bool, [u8; 32]) {
    let hash = hash_from_nonce(ctx, nonce);
    (is_valid_hash(ctx, &hash), hash)
}

/// Render a hash or target as four 64-bit words, most significant first.
pub fn format_hash(bytes: &[u8; 32]) -> String {
    let words = compare::to_words(bytes);
    words
        .iter()
        .rev()
        .map(|w| format!("{w:016x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
