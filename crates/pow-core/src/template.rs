//! Message template and nonce slot layout.

use crate::blake2s::BLOCK_SIZE;
use crate::error::PowError;
use core::fmt;

/// Nonce width in bytes.
pub const NONCE_SIZE: usize = 8;

/// Smallest accepted template (four full blocks plus one byte).
pub const MIN_TEMPLATE_LEN: usize = 4 * BLOCK_SIZE + 1;

/// Largest accepted template (five full blocks).
pub const MAX_TEMPLATE_LEN: usize = 5 * BLOCK_SIZE;

/// Where the nonce lives inside the template.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum NonceSlot {
    /// Bytes `[0, 8)`; the hash consumes the nonce, then `template[8..]`.
    #[default]
    Leading,
    /// The final 8 bytes; the hash consumes `template[..len - 8]`, then the nonce.
    Trailing,
}

impl NonceSlot {
    /// Byte offset of the nonce in a template of `len` bytes.
    pub fn offset(self, len: usize) -> usize {
        match self {
            NonceSlot::Leading => 0,
            NonceSlot::Trailing => len - NONCE_SIZE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            NonceSlot::Leading => "leading",
            NonceSlot::Trailing => "trailing",
        }
    }
}

impl fmt::Display for NonceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A validated block header, stored zero-padded to [`MAX_TEMPLATE_LEN`].
#[derive(Clone, Eq, PartialEq)]
pub struct MessageTemplate {
    bytes: [u8; MAX_TEMPLATE_LEN],
    len: usize,
}

impl MessageTemplate {
    pub fn new(input: &[u8]) -> Result<Self, PowError> {
        let len = input.len();
        if !(MIN_TEMPLATE_LEN..=MAX_TEMPLATE_LEN).contains(&len) {
            return Err(PowError::TemplateLength {
                len,
                min: MIN_TEMPLATE_LEN,
                max: MAX_TEMPLATE_LEN,
            });
        }
        let mut bytes = [0u8; MAX_TEMPLATE_LEN];
        bytes[..len].copy_from_slice(input);
        Ok(Self { bytes, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The template bytes, without padding.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// The template bytes followed by zero padding up to five blocks.
    pub fn padded(&self) -> &[u8; MAX_TEMPLATE_LEN] {
        &self.bytes
    }

    pub fn block_count(&self) -> usize {
        self.len.div_ceil(BLOCK_SIZE)
    }

    /// Number of valid bytes in the final block, `1..=64`.
    pub fn last_block_size(&self) -> usize {
        self.len - (self.block_count() - 1) * BLOCK_SIZE
    }

    /// Padded copy of the template with `nonce` written little-endian into `slot`.
    pub fn with_nonce(&self, slot: NonceSlot, nonce: u64) -> [u8; MAX_TEMPLATE_LEN] {
        let mut bytes = self.bytes;
        let offset = slot.offset(self.len);
        bytes[offset..offset + NONCE_SIZE].copy_from_slice(&nonce.to_le_bytes());
        bytes
    }
}

impl fmt::Debug for MessageTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageTemplate")
            .field("len", &self.len)
            .field("last_block_size", &self.last_block_size())
            .finish()
    }
}
