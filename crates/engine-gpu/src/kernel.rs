//! Kernel source handling and the host mirrors of its buffer layouts.

use crate::GpuError;
use bytemuck::{Pod, Zeroable};
use pow_core::JobContext;
use std::borrow::Cow;
use std::path::Path;

/// Built-in BLAKE2s search kernel.
pub const DEFAULT_KERNEL: &str = include_str!("mining.wgsl");

/// Compute entry point every kernel source must define.
pub const ENTRY_POINT: &str = "search_main";

/// Read a kernel override from disk, or fall back to the built-in kernel.
pub fn load_source(path: Option<&Path>) -> Result<Cow<'static, str>, GpuError> {
    match path {
        None => Ok(Cow::Borrowed(DEFAULT_KERNEL)),
        Some(path) => std::fs::read_to_string(path)
            .map(Cow::Owned)
            .map_err(|source| GpuError::KernelRead {
                path: path.to_path_buf(),
                source,
            }),
    }
}

/// Bind the build-time constants by prepending them to the source.
pub fn with_constants(source: &str, lanes_per_item: u32, workgroup_size: u32) -> String {
    format!(
        "const LANES_PER_ITEM: u32 = {lanes_per_item}u;\nconst WORKGROUP_SIZE: u32 = {workgroup_size}u;\n\n{source}"
    )
}

/// Host mirror of the kernel's `Job` struct (binding 0).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct JobParams {
    pub midstate: [u32; 8],
    pub target_words: [u32; 8],
    pub message_len: u32,
    pub counter_base: u32,
    pub variable_blocks: u32,
    pub nonce_offset: u32,
    pub grid_size: u32,
    pub _pad: [u32; 3],
}

impl JobParams {
    pub fn new(ctx: &JobContext, grid_size: u32) -> Self {
        Self {
            midstate: ctx.midstate,
            target_words: ctx.target.to_u32_words(),
            message_len: ctx.message_len,
            counter_base: ctx.counter_base,
            variable_blocks: ctx.variable_blocks() as u32,
            nonce_offset: ctx.nonce_offset,
            grid_size,
            _pad: [0; 3],
        }
    }
}

/// Host mirror of the kernel's `Batch` struct (binding 2).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct BatchParams {
    pub start_lo: u32,
    pub start_hi: u32,
    pub _pad: [u32; 2],
}

impl BatchParams {
    pub fn from_start(start_nonce: u64) -> Self {
        Self {
            start_lo: start_nonce as u32,
            start_hi: (start_nonce >> 32) as u32,
            _pad: [0; 2],
        }
    }
}

/// Host mirror of the kernel's `Outcome` struct (binding 3).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq)]
pub struct SearchResult {
    pub found: u32,
    pub nonce_lo: u32,
    pub nonce_hi: u32,
    pub lane: u32,
}

impl SearchResult {
    pub const SIZE: u64 = std::mem::size_of::<SearchResult>() as u64;

    pub fn nonce(&self) -> Option<u64> {
        (self.found != 0).then(|| ((self.nonce_hi as u64) << 32) | self.nonce_lo as u64)
    }
}
