//! Cross-check the GPU kernel against the reference hasher on one template.
//!
//! Reads a template from stdin (or uses a fixed one), picks the best nonce in
//! a small window on the host, then asks the GPU to find it.

use engine_cpu::{BatchGeometry, SearchBackend};
use engine_gpu::{GpuBackend, GpuConfig};
use pow_core::{compare_uint256, format_hash, reference, MessageTemplate, NonceSlot, Target};
use std::io::Read;

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let mut input = Vec::new();
    std::io::stdin().take(4096).read_to_end(&mut input)?;
    let template = if input.is_empty() {
        MessageTemplate::new(&[1u8; 300])?
    } else {
        MessageTemplate::new(&input)?
    };

    let slot = NonceSlot::Leading;
    let geometry = BatchGeometry::new(4096, 256, 16)?;
    let start = 0u64;

    log::info!("Hashing {} nonces on the host", geometry.batch_size());
    let (nonce, hash) = (start..start + geometry.batch_size())
        .map(|n| (n, reference::hash_nonce(&template, slot, n)))
        .min_by(|a, b| compare_uint256(&a.1, &b.1))
        .ok_or_else(|| anyhow::anyhow!("empty window"))?;
    log::info!("Host best nonce: {:016x} hash: {}", nonce, format_hash(&hash));

    let mut gpu = GpuBackend::new(GpuConfig::default())?;
    let started = std::time::Instant::now();
    gpu.start_search(geometry, slot, &template, &Target::from_bytes(hash))?;
    let found = gpu.continue_search(start)?;
    log::info!("GPU search took {:?}", started.elapsed());

    match found {
        Some(n) if n == nonce => log::info!("GPU agrees: {:016x}", n),
        Some(n) => log::error!("FAILURE: GPU reported {:016x}, expected {:016x}", n, nonce),
        None => log::error!("FAILURE: GPU missed {:016x}", nonce),
    }
    Ok(())
}
