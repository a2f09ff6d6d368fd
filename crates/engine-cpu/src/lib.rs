#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Search backend trait, batch partitioning, and a host-thread backend.
//!
//! This crate defines the `SearchBackend` trait so the driver can scan the
//! nonce space without knowing which device does the work, plus:
//! - `BatchGeometry`: the grid/lane partition of one batch
//! - `ResultSlot`: the write-once result register shared by all lanes
//! - `CpuBackend`: runs the kernel algorithm (`pow_core::hash_from_nonce`) on
//!   host threads, for machines without a GPU and for parity testing.

use anyhow::{anyhow, ensure, Result};
use pow_core::{hash_from_nonce, is_valid_hash, JobContext, MessageTemplate, NonceSlot, Target};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::thread;

/// Shape of one batch: `grid_size` lanes, each scanning `lanes_per_item`
/// consecutive nonces, scheduled in groups of `local_size` lanes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BatchGeometry {
    pub grid_size: u64,
    pub local_size: u32,
    pub lanes_per_item: u64,
}

impl BatchGeometry {
    pub const DEFAULT_GRID_SIZE: u64 = 1024 * 1024 * 16;
    pub const DEFAULT_LOCAL_SIZE: u32 = 256;
    pub const DEFAULT_LANES_PER_ITEM: u64 = 64;

    pub fn new(grid_size: u64, local_size: u32, lanes_per_item: u64) -> Result<Self> {
        let geometry = Self {
            grid_size,
            local_size,
            lanes_per_item,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.grid_size >= 1, "grid size must be at least 1");
        ensure!(self.local_size >= 1, "local work size must be at least 1");
        ensure!(self.lanes_per_item >= 1, "work set size must be at least 1");
        ensure!(
            self.grid_size.checked_mul(self.lanes_per_item).is_some(),
            "batch of {} x {} nonces overflows 64 bits",
            self.grid_size,
            self.lanes_per_item
        );
        Ok(())
    }

    /// Nonces covered by one batch.
    pub fn batch_size(&self) -> u64 {
        self.grid_size * self.lanes_per_item
    }

    /// Number of lane groups (rounded up; the last one may be partial).
    pub fn lane_groups(&self) -> u64 {
        self.grid_size.div_ceil(self.local_size as u64)
    }

    /// Sub-range owned by `lane` in the batch starting at `start_nonce`.
    pub fn lane_range(&self, start_nonce: u64, lane: u64) -> LaneRange {
        LaneRange {
            start: start_nonce.wrapping_add(lane * self.lanes_per_item),
            len: self.lanes_per_item,
        }
    }
}

impl Default for BatchGeometry {
    fn default() -> Self {
        Self {
            grid_size: Self::DEFAULT_GRID_SIZE,
            local_size: Self::DEFAULT_LOCAL_SIZE,
            lanes_per_item: Self::DEFAULT_LANES_PER_ITEM,
        }
    }
}

/// Contiguous nonces `[start, start + len)`, wrapping modulo 2^64.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LaneRange {
    pub start: u64,
    pub len: u64,
}

impl LaneRange {
    pub fn nonces(&self) -> impl Iterator<Item = u64> {
        let start = self.start;
        (0..self.len).map(move |i| start.wrapping_add(i))
    }
}

/// Write-once result register for a batch.
///
/// The found flag is separate from the value, so nonce 0 is a valid answer.
/// The first lane to flip the flag owns the value; later finds are dropped.
#[derive(Debug, Default)]
pub struct ResultSlot {
    found: AtomicBool,
    nonce: AtomicU64,
}

impl ResultSlot {
    pub fn reset(&self) {
        self.found.store(false, AtomicOrdering::SeqCst);
        self.nonce.store(0, AtomicOrdering::SeqCst);
    }

    /// Returns `true` if this call won the slot.
    pub fn claim(&self, nonce: u64) -> bool {
        if self.found.swap(true, AtomicOrdering::AcqRel) {
            return false;
        }
        self.nonce.store(nonce, AtomicOrdering::Release);
        true
    }

    pub fn is_set(&self) -> bool {
        self.found.load(AtomicOrdering::Acquire)
    }

    /// Read the slot once every lane of the batch has finished.
    pub fn get(&self) -> Option<u64> {
        self.is_set()
            .then(|| self.nonce.load(AtomicOrdering::Acquire))
    }
}

/// Dispatch backend interface.
///
/// The driver depends only on this trait. A backend owns its device for the
/// whole run: `start_search` derives and uploads everything that is fixed for
/// the run, `continue_search` scans exactly one batch and blocks until it is
/// complete.
pub trait SearchBackend: Send {
    /// Human-readable backend name (for logs/metrics).
    fn name(&self) -> &'static str;

    /// Derive the mid-state and constants for the `slot` layout, build the
    /// kernel, allocate the result slot.
    fn start_search(
        &mut self,
        geometry: BatchGeometry,
        slot: NonceSlot,
        template: &MessageTemplate,
        target: &Target,
    ) -> Result<()>;

    /// Scan the batch starting at `start_nonce`. `None` is a miss.
    fn continue_search(&mut self, start_nonce: u64) -> Result<Option<u64>>;
}

/// Evaluate one lane through the mid-state path and return its first hit.
pub fn search_lane(ctx: &JobContext, range: LaneRange) -> Option<u64> {
    range
        .nonces()
        .find(|&nonce| is_valid_hash(ctx, &hash_from_nonce(ctx, nonce)))
}

struct CpuJob {
    ctx: JobContext,
    geometry: BatchGeometry,
    result: ResultSlot,
}

/// Host-thread backend.
///
/// Worker threads pull lane groups from a shared cursor and run each lane
/// exactly as a kernel invocation would. Once a lane claims the result slot,
/// the other workers stop at their next lane boundary.
pub struct CpuBackend {
    threads: usize,
    job: Option<CpuJob>,
}

impl CpuBackend {
    /// `threads = None` uses every logical CPU.
    pub fn new(threads: Option<usize>) -> Self {
        let threads = threads.unwrap_or_else(num_cpus::get).max(1);
        Self {
            threads,
            job: None,
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

fn run_worker(job: &CpuJob, start_nonce: u64, cursor: &AtomicU64) {
    let groups = job.geometry.lane_groups();
    let local = job.geometry.local_size as u64;
    loop {
        if job.result.is_set() {
            return;
        }
        let group = cursor.fetch_add(1, AtomicOrdering::Relaxed);
        if group >= groups {
            return;
        }
        let first_lane = group * local;
        let end_lane = (first_lane + local).min(job.geometry.grid_size);
        for lane in first_lane..end_lane {
            if let Some(nonce) = search_lane(&job.ctx, job.geometry.lane_range(start_nonce, lane)) {
                job.result.claim(nonce);
                return;
            }
            if job.result.is_set() {
                return;
            }
        }
    }
}

impl SearchBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn start_search(
        &mut self,
        geometry: BatchGeometry,
        slot: NonceSlot,
        template: &MessageTemplate,
        target: &Target,
    ) -> Result<()> {
        geometry.validate()?;
        let ctx = JobContext::new(template.clone(), slot, *target);
        log::debug!(
            target: "engine_cpu",
            "cpu search prepared: {} threads, {} lanes x {} nonces, {} variable block(s)",
            self.threads,
            geometry.grid_size,
            geometry.lanes_per_item,
            ctx.variable_blocks()
        );
        self.job = Some(CpuJob {
            ctx,
            geometry,
            result: ResultSlot::default(),
        });
        Ok(())
    }

    fn continue_search(&mut self, start_nonce: u64) -> Result<Option<u64>> {
        let job = self
            .job
            .as_ref()
            .ok_or_else(|| anyhow!("continue_search called before start_search"))?;
        job.result.reset();

        let cursor = AtomicU64::new(0);
        let workers = (self.threads as u64).min(job.geometry.lane_groups()) as usize;
        thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| run_worker(job, start_nonce, &cursor));
            }
        });

        Ok(job.result.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pow_core::reference;
    use rand::{Rng, SeedableRng};

    fn make_template(seed: u64, len: usize) -> MessageTemplate {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
        let mut bytes = vec![0u8; len];
        rng.fill(&mut bytes[..]);
        MessageTemplate::new(&bytes).unwrap()
    }

    #[test]
    fn partition_covers_batch_without_gaps_or_overlaps() {
        for (grid, local, lanes) in [(1u64, 1u32, 1u64), (7, 3, 5), (16, 4, 1), (33, 8, 9), (100, 256, 3)] {
            let geometry = BatchGeometry::new(grid, local, lanes).unwrap();
            let start = u64::MAX - 40;
            let mut seen: Vec<u64> = (0..grid)
                .flat_map(|lane| geometry.lane_range(start, lane).nonces())
                .collect();
            assert_eq!(seen.len() as u64, geometry.batch_size());
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len() as u64, geometry.batch_size(), "overlap for {grid}x{lanes}");

            let expected: Vec<u64> = {
                let mut v: Vec<u64> = (0..geometry.batch_size()).map(|i| start.wrapping_add(i)).collect();
                v.sort_unstable();
                v
            };
            assert_eq!(seen, expected, "gap for {grid}x{lanes}");
        }
    }

    #[test]
    fn geometry_rejects_degenerate_shapes() {
        assert!(BatchGeometry::new(0, 256, 64).is_err());
        assert!(BatchGeometry::new(16, 0, 64).is_err());
        assert!(BatchGeometry::new(16, 256, 0).is_err());
        assert!(BatchGeometry::new(u64::MAX, 256, 2).is_err());
        assert_eq!(BatchGeometry::default().batch_size(), 1 << 30);
    }

    #[test]
    fn lane_groups_round_up() {
        let geometry = BatchGeometry::new(10, 4, 1).unwrap();
        assert_eq!(geometry.lane_groups(), 3);
    }

    #[test]
    fn result_slot_is_write_once() {
        let slot = ResultSlot::default();
        assert_eq!(slot.get(), None);
        assert!(slot.claim(0));
        assert!(!slot.claim(17));
        assert_eq!(slot.get(), Some(0));
        slot.reset();
        assert_eq!(slot.get(), None);
    }

    #[test]
    fn continue_before_start_is_an_error() {
        let mut backend = CpuBackend::new(Some(2));
        assert!(backend.continue_search(0).is_err());
    }

    #[test]
    fn zero_nonce_is_reported_distinctly_from_miss() {
        let template = make_template(1, 300);
        let mut backend = CpuBackend::new(Some(2));
        backend
            .start_search(BatchGeometry::new(4, 2, 4).unwrap(), NonceSlot::Leading, &template, &Target::MAX)
            .unwrap();
        // Every hash qualifies; whichever lane wins, the batch is not a miss.
        let found = backend.continue_search(0).unwrap();
        assert!(found.is_some());
        assert!(found.unwrap() < 16);

        let single = BatchGeometry::new(1, 1, 1).unwrap();
        backend
            .start_search(single, NonceSlot::Leading, &template, &Target::MAX)
            .unwrap();
        assert_eq!(backend.continue_search(0).unwrap(), Some(0));
    }

    #[test]
    fn impossible_target_misses() {
        let template = make_template(2, 290);
        let mut backend = CpuBackend::new(Some(3));
        backend
            .start_search(
                BatchGeometry::new(8, 4, 8).unwrap(),
                NonceSlot::Trailing,
                &template,
                &Target::from_bytes([0u8; 32]),
            )
            .unwrap();
        assert_eq!(backend.continue_search(12345).unwrap(), None);
    }

    #[test]
    fn found_nonce_lies_in_batch_and_verifies() {
        let template = make_template(3, 320);
        let geometry = BatchGeometry::new(32, 8, 16).unwrap();
        let start = 1_000_000u64;

        // Target = the smallest hash in the batch, so exactly that nonce qualifies.
        let (best_nonce, best_hash) = (start..start + geometry.batch_size())
            .map(|n| (n, reference::hash_nonce(&template, NonceSlot::Leading, n)))
            .min_by(|a, b| pow_core::compare_uint256(&a.1, &b.1))
            .unwrap();

        let mut backend = CpuBackend::new(Some(4));
        backend
            .start_search(geometry, NonceSlot::Leading, &template, &Target::from_bytes(best_hash))
            .unwrap();
        assert_eq!(backend.continue_search(start).unwrap(), Some(best_nonce));
        // A second call reuses the job and reports the same winner.
        assert_eq!(backend.continue_search(start).unwrap(), Some(best_nonce));
    }

    #[test]
    fn search_lane_agrees_with_reference_lane_scan() {
        let template = make_template(4, 263);
        let mut hash_target = [0xffu8; 32];
        hash_target[31] = 0x20; // roughly one in eight hashes qualifies
        let target = Target::from_bytes(hash_target);
        for slot in [NonceSlot::Leading, NonceSlot::Trailing] {
            let ctx = JobContext::new(template.clone(), slot, target);
            let geometry = BatchGeometry::new(16, 4, 32).unwrap();
            for lane in 0..geometry.grid_size {
                assert_eq!(
                    search_lane(&ctx, geometry.lane_range(500, lane)),
                    reference::search_lane(&template, slot, &target, 500, 32, lane),
                    "slot={slot} lane={lane}"
                );
            }
        }
    }
}
