use thiserror::Error;

/// Input validation failures for templates and targets.
#[derive(Debug, Error)]
pub enum PowError {
    #[error("message template must be {min}..={max} bytes, got {len}")]
    TemplateLength { len: usize, min: usize, max: usize },

    #[error("target must be 64 hex characters, got {0}")]
    TargetLength(usize),

    #[error("target is not valid hex: {0}")]
    TargetHex(#[from] hex::FromHexError),
}
