use crate::compare::to_words;
use crate::error::PowError;
use core::fmt;
use core::str::FromStr;

/// 256-bit difficulty target.
///
/// Parsed from 64 hex characters, one byte per pair, in string order. The
/// bytes are then read with the same word order as a hash (see
/// [`crate::compare`]).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Target([u8; 32]);

impl Target {
    /// Every hash qualifies.
    pub const MAX: Target = Target([0xff; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn words(&self) -> [u64; 4] {
        to_words(&self.0)
    }

    /// Eight little-endian `u32` words, the layout the kernel compares.
    pub fn to_u32_words(&self) -> [u32; 8] {
        let mut out = [0u32; 8];
        for (word, chunk) in out.iter_mut().zip(self.0.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        out
    }
}

impl FromStr for Target {
    type Err = PowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(PowError::TargetLength(s.len()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
