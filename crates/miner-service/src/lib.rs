//! Search driver for the BLAKE2s nonce search.
//!
//! This crate provides:
//! - Backend selection (GPU or CPU)
//! - The outer loop that walks the nonce space one batch at a time
//! - Host verification of every nonce a backend reports
//! - The report printed on success

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

use engine_cpu::{BatchGeometry, CpuBackend, SearchBackend};
use engine_gpu::{GpuBackend, GpuConfig};
use pow_core::{format_hash, meets_target, reference, MessageTemplate, NonceSlot, Target};
use std::fmt;
use std::time::{Duration, Instant};

/// Which dispatch backend to run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EngineKind {
    #[default]
    Gpu,
    Cpu,
}

/// Backend selection provided by the CLI/binary.
#[derive(Clone, Debug, Default)]
pub struct BackendConfig {
    pub engine: EngineKind,
    pub gpu: GpuConfig,
    /// CPU worker threads (None = all logical cores).
    pub cpu_threads: Option<usize>,
}

/// Search runtime configuration provided by the CLI/binary.
#[derive(Clone, Debug, Default)]
pub struct SearchConfig {
    pub geometry: BatchGeometry,
    pub slot: NonceSlot,
    /// Explicit start nonce; random when `None`.
    pub start_nonce: Option<u64>,
    /// Stop with `Exhausted` after this many batches.
    pub max_batches: Option<u64>,
    /// Instant the reported rate is measured from. The binary sets this at
    /// process start so device setup counts; `None` starts the clock at
    /// `start_search`.
    pub clock_start: Option<Instant>,
}

impl fmt::Display for SearchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "grid={} local={} work_set={} batch={} nonce={} start=",
            self.geometry.grid_size,
            self.geometry.local_size,
            self.geometry.lanes_per_item,
            self.geometry.batch_size(),
            self.slot
        )?;
        match self.start_nonce {
            Some(n) => write!(f, "{n:#x}")?,
            None => f.write_str("random")?,
        }
        if let Some(max) = self.max_batches {
            write!(f, " max_batches={max}")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error(transparent)]
    Backend(#[from] anyhow::Error),

    #[error("failed to draw a random start nonce: {0}")]
    Entropy(String),

    #[error(
        "backend reported nonce {nonce:016x} but it does not meet the target\ntarget: {}\nhash:   {}",
        format_hash(.target.as_bytes()),
        format_hash(.hash)
    )]
    VerificationFailed {
        nonce: u64,
        target: Target,
        hash: [u8; 32],
    },

    #[error("nonce space exhausted after {batches} batch(es)")]
    Exhausted { batches: u64 },
}

/// A verified result.
#[derive(Clone, Debug)]
pub struct SearchReport {
    pub nonce: u64,
    pub hash: [u8; 32],
    pub batches: u64,
    /// Nonces covered by every dispatched batch, the winning one included.
    pub hash_count: u128,
    pub elapsed: Duration,
}

impl SearchReport {
    /// Average hashes per second, truncated.
    pub fn hash_rate(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.hash_count as f64 / secs) as u64
        } else {
            0
        }
    }
}

/// `<nonce> <total hashes> <hashes per second>`, the line printed on stdout.
impl fmt::Display for SearchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x} {} {}", self.nonce, self.hash_count, self.hash_rate())
    }
}

/// Random start nonce: 8 bytes of OS entropy read little-endian.
pub fn generate_random_nonce() -> Result<u64, SearchError> {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).map_err(|e| SearchError::Entropy(e.to_string()))?;
    Ok(u64::from_le_bytes(bytes))
}

/// Open the requested backend.
pub fn build_backend(config: &BackendConfig) -> anyhow::Result<Box<dyn SearchBackend>> {
    match config.engine {
        EngineKind::Gpu => {
            let backend = GpuBackend::new(config.gpu.clone())?;
            let info = backend.adapter_info();
            log::info!(target: "miner", "GPU engine: {} ({:?})", info.name, info.backend);
            #[cfg(feature = "metrics")]
            metrics::set_engine_info("gpu-wgpu", &info.name);
            Ok(Box::new(backend))
        }
        EngineKind::Cpu => {
            let backend = CpuBackend::new(config.cpu_threads);
            log::info!(target: "miner", "CPU engine: {} threads", backend.threads());
            #[cfg(feature = "metrics")]
            metrics::set_engine_info("cpu", "host");
            Ok(Box::new(backend))
        }
    }
}

/// Outer search loop: one batch in flight, each hit re-verified on the host.
pub struct SearchDriver<'a> {
    backend: &'a mut dyn SearchBackend,
    config: SearchConfig,
}

impl<'a> SearchDriver<'a> {
    pub fn new(backend: &'a mut dyn SearchBackend, config: SearchConfig) -> Self {
        Self { backend, config }
    }

    /// Search until a verified nonce is found or the nonce space runs out.
    pub fn run(&mut self, template: &MessageTemplate, target: &Target) -> Result<SearchReport, SearchError> {
        let geometry = self.config.geometry;
        geometry.validate()?;
        let batch_size = geometry.batch_size();
        let mut start_nonce = match self.config.start_nonce {
            Some(n) => {
                log::debug!(target: "miner", "Using {n:#x} as nonce");
                n
            }
            None => {
                log::debug!(target: "miner", "Using OS entropy as nonce source");
                generate_random_nonce()?
            }
        };
        // Batches needed to cover all 2^64 nonces.
        let full_cover = (1u128 << 64).div_ceil(batch_size as u128);
        let limit = self
            .config
            .max_batches
            .map_or(full_cover, |m| (m as u128).min(full_cover));

        log::debug!(
            target: "miner",
            "Template: {} bytes, last_block_size = {}",
            template.len(),
            template.last_block_size()
        );

        let started = self.config.clock_start.unwrap_or_else(Instant::now);
        self.backend
            .start_search(geometry, self.config.slot, template, target)?;
        #[cfg(feature = "metrics")]
        {
            metrics::reset_hash_rate();
            metrics::set_geometry(geometry.grid_size, batch_size);
        }

        let mut batches = 0u64;
        loop {
            if batches as u128 >= limit {
                log::warn!(target: "miner", "Nonce space exhausted after {} batches", batches);
                return Err(SearchError::Exhausted { batches });
            }

            log::debug!(
                target: "miner",
                "Trying {:#x} - {:#x}",
                start_nonce,
                start_nonce.wrapping_add(batch_size - 1)
            );
            let found = self.backend.continue_search(start_nonce)?;
            batches += 1;
            #[cfg(feature = "metrics")]
            metrics::record_batch(batch_size);

            let Some(nonce) = found else {
                start_nonce = start_nonce.wrapping_add(batch_size);
                continue;
            };

            #[cfg(feature = "metrics")]
            metrics::inc_candidates();
            log::debug!(target: "miner", "Done {nonce:#x}!");

            let hash = reference::hash_nonce(template, self.config.slot, nonce);
            if !meets_target(&hash, target.as_bytes()) {
                #[cfg(feature = "metrics")]
                metrics::inc_verification_failures();
                log::error!(
                    target: "miner",
                    "{} backend reported nonce {:016x} that fails verification",
                    self.backend.name(),
                    nonce
                );
                return Err(SearchError::VerificationFailed {
                    nonce,
                    target: *target,
                    hash,
                });
            }

            let report = SearchReport {
                nonce,
                hash,
                batches,
                hash_count: batches as u128 * batch_size as u128,
                elapsed: started.elapsed(),
            };
            log::info!(
                target: "miner",
                "Found nonce {:016x} after {} batch(es), hash {}",
                nonce,
                batches,
                format_hash(&hash)
            );
            return Ok(report);
        }
    }
}

/// Convenience wrapper around [`SearchDriver`].
pub fn run_search(
    backend: &mut dyn SearchBackend,
    config: SearchConfig,
    template: &MessageTemplate,
    target: &Target,
) -> Result<SearchReport, SearchError> {
    SearchDriver::new(backend, config).run(template, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use blake2::{Blake2s256, Digest};
    use pow_core::compare_uint256;
    use rand::{Rng, SeedableRng};

    fn random_template(seed: u64, len: usize) -> MessageTemplate {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
        let mut bytes = vec![0u8; len];
        rng.fill(&mut bytes[..]);
        MessageTemplate::new(&bytes).unwrap()
    }

    fn config(geometry: BatchGeometry, slot: NonceSlot, start: u64) -> SearchConfig {
        SearchConfig {
            geometry,
            slot,
            start_nonce: Some(start),
            max_batches: None,
            clock_start: None,
        }
    }

    /// Smallest reference hash in `[start, start + count)`.
    fn best_in_window(template: &MessageTemplate, slot: NonceSlot, start: u64, count: u64) -> (u64, [u8; 32]) {
        (0..count)
            .map(|i| start.wrapping_add(i))
            .map(|n| (n, reference::hash_nonce(template, slot, n)))
            .min_by(|a, b| compare_uint256(&a.1, &b.1))
            .unwrap()
    }

    #[test]
    fn round_trip_finds_planted_nonce_in_later_batch() {
        let template = random_template(21, 300);
        let geometry = BatchGeometry::new(16, 4, 8).unwrap();
        let start = 5_000u64;
        // The winner lies somewhere in the first four batches.
        let (nonce, hash) = best_in_window(&template, NonceSlot::Leading, start, 4 * geometry.batch_size());

        let mut backend = CpuBackend::new(Some(2));
        let report = run_search(
            &mut backend,
            config(geometry, NonceSlot::Leading, start),
            &template,
            &Target::from_bytes(hash),
        )
        .unwrap();

        assert_eq!(report.nonce, nonce);
        assert_eq!(report.hash, hash);
        let expected_batches = (nonce - start) / geometry.batch_size() + 1;
        assert_eq!(report.batches, expected_batches);
        assert_eq!(report.hash_count, (expected_batches * geometry.batch_size()) as u128);
    }

    #[test]
    fn both_layouts_round_trip() {
        let template = random_template(22, 257);
        let geometry = BatchGeometry::new(32, 8, 4).unwrap();
        for slot in [NonceSlot::Leading, NonceSlot::Trailing] {
            let (nonce, hash) = best_in_window(&template, slot, 0, geometry.batch_size());
            let mut backend = CpuBackend::new(Some(3));
            let report = run_search(
                &mut backend,
                config(geometry, slot, 0),
                &template,
                &Target::from_bytes(hash),
            )
            .unwrap();
            assert_eq!(report.nonce, nonce, "slot={slot}");
        }
    }

    #[test]
    fn layout_comes_from_search_config() {
        let template = random_template(29, 300);
        let single = BatchGeometry::new(1, 1, 1).unwrap();
        let trailing_hash = reference::hash_nonce(&template, NonceSlot::Trailing, 5);
        let leading_hash = reference::hash_nonce(&template, NonceSlot::Leading, 5);

        // The backend is built without any layout; the driver hands it over.
        let mut backend = build_backend(&BackendConfig {
            engine: EngineKind::Cpu,
            cpu_threads: Some(1),
            ..Default::default()
        })
        .unwrap();
        let report = run_search(
            backend.as_mut(),
            config(single, NonceSlot::Trailing, 5),
            &template,
            &Target::from_bytes(trailing_hash),
        )
        .unwrap();
        assert_eq!(report.nonce, 5);
        assert_eq!(report.hash, trailing_hash);

        let mut cfg = config(single, NonceSlot::Trailing, 5);
        cfg.max_batches = Some(1);
        let result = run_search(backend.as_mut(), cfg, &template, &Target::from_bytes(leading_hash));
        assert!(!matches!(result, Err(SearchError::VerificationFailed { .. })));
    }

    #[test]
    fn moving_the_nonce_between_slots_finds_the_same_nonce() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(30);
        let mut body = vec![0u8; 292];
        rng.fill(&mut body[..]);
        let leading = MessageTemplate::new(&[&[0u8; 8][..], &body[..]].concat()).unwrap();
        let trailing = MessageTemplate::new(&[&body[..], &[0u8; 8][..]].concat()).unwrap();
        let geometry = BatchGeometry::new(16, 4, 4).unwrap();
        let start = 0x1234_5678_9abc_def0u64;

        let mut found = Vec::new();
        for (slot, template) in [(NonceSlot::Leading, &leading), (NonceSlot::Trailing, &trailing)] {
            // One worker scans lanes in order, so the first qualifying nonce wins.
            let mut backend = CpuBackend::new(Some(1));
            let report = run_search(&mut backend, config(geometry, slot, start), template, &Target::MAX).unwrap();

            let nonce = report.nonce.to_le_bytes();
            let message = match slot {
                NonceSlot::Leading => [&nonce[..], &body[..]].concat(),
                NonceSlot::Trailing => [&body[..], &nonce[..]].concat(),
            };
            let expected: [u8; 32] = Blake2s256::digest(&message).into();
            assert_eq!(report.hash, expected, "slot={slot}");
            found.push(report.nonce);

            // A zero target misses in either layout after the same number of batches.
            let mut backend = CpuBackend::new(Some(2));
            let mut cfg = config(geometry, slot, start);
            cfg.max_batches = Some(2);
            let err = run_search(&mut backend, cfg, template, &Target::from_bytes([0u8; 32])).unwrap_err();
            assert!(matches!(err, SearchError::Exhausted { batches: 2 }), "slot={slot}");
        }
        assert_eq!(found, [start, start]);
    }

    #[test]
    fn rate_clock_can_start_before_the_search() {
        let template = random_template(31, 264);
        let mut backend = CpuBackend::new(Some(1));
        let mut cfg = config(BatchGeometry::new(1, 1, 1).unwrap(), NonceSlot::Leading, 0);
        let Some(earlier) = Instant::now().checked_sub(Duration::from_secs(2)) else {
            return;
        };
        cfg.clock_start = Some(earlier);
        let report = run_search(&mut backend, cfg, &template, &Target::MAX).unwrap();
        assert!(report.elapsed >= Duration::from_secs(2));
    }

    #[test]
    fn search_wraps_past_top_of_nonce_space() {
        let template = random_template(23, 320);
        let geometry = BatchGeometry::new(8, 8, 8).unwrap();
        let start = u64::MAX - 31;
        // Window straddles 2^64: 32 nonces below, 96 above.
        let (nonce, hash) = best_in_window(&template, NonceSlot::Trailing, start, 2 * geometry.batch_size());

        let mut backend = CpuBackend::new(Some(2));
        let report = run_search(
            &mut backend,
            config(geometry, NonceSlot::Trailing, start),
            &template,
            &Target::from_bytes(hash),
        )
        .unwrap();
        assert_eq!(report.nonce, nonce);
    }

    #[test]
    fn zero_nonce_is_reported() {
        let template = random_template(24, 280);
        let mut backend = CpuBackend::new(Some(1));
        let report = run_search(
            &mut backend,
            config(BatchGeometry::new(1, 1, 1).unwrap(), NonceSlot::Leading, 0),
            &template,
            &Target::MAX,
        )
        .unwrap();
        assert_eq!(report.nonce, 0);
        assert_eq!(report.batches, 1);
        assert!(report.to_string().starts_with("0000000000000000 1 "));
    }

    #[test]
    fn max_batches_bounds_the_search() {
        let template = random_template(25, 290);
        let mut backend = CpuBackend::new(Some(2));
        let mut cfg = config(BatchGeometry::new(4, 4, 4).unwrap(), NonceSlot::Leading, 0);
        cfg.max_batches = Some(3);
        let err = run_search(&mut backend, cfg, &template, &Target::from_bytes([0u8; 32])).unwrap_err();
        assert!(matches!(err, SearchError::Exhausted { batches: 3 }));
    }

    #[test]
    fn full_cover_of_nonce_space_ends_in_exhaustion() {
        /// Never finds anything and counts the batches it was asked for.
        struct Miss(u64);
        impl SearchBackend for Miss {
            fn name(&self) -> &'static str {
                "miss"
            }
            fn start_search(
                &mut self,
                _: BatchGeometry,
                _: NonceSlot,
                _: &MessageTemplate,
                _: &Target,
            ) -> anyhow::Result<()> {
                Ok(())
            }
            fn continue_search(&mut self, _: u64) -> anyhow::Result<Option<u64>> {
                self.0 += 1;
                Ok(None)
            }
        }

        let template = random_template(26, 260);
        // 2^62 nonces per batch, so four batches cover the whole space.
        let geometry = BatchGeometry::new(1 << 31, 256, 1 << 31).unwrap();
        let mut backend = Miss(0);
        let err = run_search(&mut backend, config(geometry, NonceSlot::Leading, 7), &template, &Target::MAX)
            .unwrap_err();
        assert!(matches!(err, SearchError::Exhausted { batches: 4 }));
        assert_eq!(backend.0, 4);
    }

    #[test]
    fn lying_backend_fails_verification() {
        struct Liar;
        impl SearchBackend for Liar {
            fn name(&self) -> &'static str {
                "liar"
            }
            fn start_search(
                &mut self,
                _: BatchGeometry,
                _: NonceSlot,
                _: &MessageTemplate,
                _: &Target,
            ) -> anyhow::Result<()> {
                Ok(())
            }
            fn continue_search(&mut self, start: u64) -> anyhow::Result<Option<u64>> {
                Ok(Some(start))
            }
        }

        let template = random_template(27, 270);
        let zero = Target::from_bytes([0u8; 32]);
        let err = run_search(
            &mut Liar,
            config(BatchGeometry::new(1, 1, 1).unwrap(), NonceSlot::Leading, 42),
            &template,
            &zero,
        )
        .unwrap_err();
        match err {
            SearchError::VerificationFailed { nonce, hash, .. } => {
                assert_eq!(nonce, 42);
                assert_eq!(hash, reference::hash_nonce(&template, NonceSlot::Leading, 42));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn backend_errors_propagate() {
        let template = random_template(28, 300);
        let mut backend = CpuBackend::new(Some(1));
        let mut cfg = config(BatchGeometry::new(1, 1, 1).unwrap(), NonceSlot::Leading, 0);
        cfg.geometry.grid_size = 0;
        let err = SearchDriver::new(&mut backend, cfg).run(&template, &Target::MAX);
        assert!(matches!(err, Err(SearchError::Backend(_))));
    }

    #[test]
    fn report_line_format() {
        let report = SearchReport {
            nonce: 0xabc,
            hash: [0u8; 32],
            batches: 2,
            hash_count: 2048,
            elapsed: Duration::from_millis(500),
        };
        assert_eq!(report.hash_rate(), 4096);
        assert_eq!(report.to_string(), "0000000000000abc 2048 4096");
    }

    #[test]
    fn config_display_mentions_start() {
        let mut cfg = SearchConfig::default();
        assert!(cfg.to_string().ends_with("start=random"));
        cfg.start_nonce = Some(0x10);
        cfg.max_batches = Some(5);
        assert!(cfg.to_string().contains("start=0x10 max_batches=5"));
        assert!(cfg.to_string().contains("batch=1073741824"));
    }

    #[test]
    fn random_nonces_differ() {
        let a = generate_random_nonce().unwrap();
        let b = generate_random_nonce().unwrap();
        let c = generate_random_nonce().unwrap();
        assert!(a != b || b != c);
    }
}
