#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Prometheus metrics for the nonce search.
//!
//! - `miner_hash_rate`: hashes per second since the search started
//! - `miner_hashes_total`: nonces evaluated
//! - `miner_batches_total`: batches dispatched
//! - `miner_candidates_total`: nonces reported by the backend
//! - `miner_verification_failures_total`: reported nonces the host rejected
//! - `miner_batch_size` / `miner_grid_size`: current geometry
//! - `miner_engine_info{engine,device}`: set to 1 for the active backend
//!
//! Optionally runs a Warp-based HTTP endpoint (`/metrics`) when the
//! `http-exporter` feature is enabled.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntGauge, IntGaugeVec, Opts, Registry};
use std::sync::Mutex;
use std::time::Instant;

#[cfg(feature = "http-exporter")]
use {std::net::SocketAddr, warp::Filter};

use anyhow::Result;
use prometheus::{Encoder, TextEncoder};

// ---------------------------------------------------------------------------
// Global Registry
// ---------------------------------------------------------------------------

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn register<M>(metric: M, name: &str) -> M
where
    M: prometheus::core::Collector + Clone + 'static,
{
    if let Err(e) = REGISTRY.register(Box::new(metric.clone())) {
        log::warn!("failed to register {name}: {e}");
    }
    metric
}

// ---------------------------------------------------------------------------
// Throughput
// ---------------------------------------------------------------------------

static HASH_RATE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("miner_hash_rate", "Hash rate in hashes per second")
        .expect("create miner_hash_rate");
    register(g, "miner_hash_rate")
});

static HASHES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("miner_hashes_total", "Total nonces evaluated")
        .expect("create miner_hashes_total");
    register(c, "miner_hashes_total")
});

static BATCHES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("miner_batches_total", "Total batches dispatched")
        .expect("create miner_batches_total");
    register(c, "miner_batches_total")
});

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

static CANDIDATES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("miner_candidates_total", "Nonces reported by the backend")
        .expect("create miner_candidates_total");
    register(c, "miner_candidates_total")
});

static VERIFICATION_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "miner_verification_failures_total",
        "Reported nonces that failed host verification",
    )
    .expect("create miner_verification_failures_total");
    register(c, "miner_verification_failures_total")
});

// ---------------------------------------------------------------------------
// Geometry and engine
// ---------------------------------------------------------------------------

static BATCH_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("miner_batch_size", "Nonces per batch")
        .expect("create miner_batch_size");
    register(g, "miner_batch_size")
});

static GRID_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("miner_grid_size", "Lanes per batch")
        .expect("create miner_grid_size");
    register(g, "miner_grid_size")
});

static ENGINE_INFO: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new("miner_engine_info", "Active search backend"),
        &["engine", "device"],
    )
    .expect("create miner_engine_info");
    register(g, "miner_engine_info")
});

// ---------------------------------------------------------------------------
// Hash Rate Tracking
// ---------------------------------------------------------------------------

/// Tracks cumulative hashes to compute the average rate.
struct HashRateTracker {
    total: u64,
    /// When tracking started (or was last reset)
    start_time: Instant,
}

impl HashRateTracker {
    fn new() -> Self {
        Self {
            total: 0,
            start_time: Instant::now(),
        }
    }

    fn record(&mut self, hashes: u64) {
        self.total += hashes;
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            HASH_RATE.set((self.total as f64 / elapsed) as i64);
        }
    }
}

static HASH_TRACKER: Lazy<Mutex<HashRateTracker>> =
    Lazy::new(|| Mutex::new(HashRateTracker::new()));

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Restart rate tracking at the beginning of a search.
pub fn reset_hash_rate() {
    if let Ok(mut tracker) = HASH_TRACKER.lock() {
        *tracker = HashRateTracker::new();
    }
    HASH_RATE.set(0);
}

/// Record one completed batch of `hashes` nonces.
pub fn record_batch(hashes: u64) {
    BATCHES_TOTAL.inc();
    HASHES_TOTAL.inc_by(hashes);
    if let Ok(mut tracker) = HASH_TRACKER.lock() {
        tracker.record(hashes);
    }
}

pub fn inc_candidates() {
    CANDIDATES_TOTAL.inc();
}

pub fn inc_verification_failures() {
    VERIFICATION_FAILURES_TOTAL.inc();
}

/// Publish the batch geometry.
pub fn set_geometry(grid_size: u64, batch_size: u64) {
    GRID_SIZE.set(grid_size.min(i64::MAX as u64) as i64);
    BATCH_SIZE.set(batch_size.min(i64::MAX as u64) as i64);
}

/// Mark `engine` on `device` as the active backend.
pub fn set_engine_info(engine: &str, device: &str) {
    ENGINE_INFO.with_label_values(&[engine, device]).set(1);
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_text() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::with_capacity(4096);
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// ---------------------------------------------------------------------------
// HTTP Exporter
// ---------------------------------------------------------------------------

/// Start the Prometheus HTTP exporter on `0.0.0.0:port`.
///
/// Spawns the exporter as a background task and returns immediately.
/// Serves plaintext metrics at `GET /metrics`.
#[cfg(feature = "http-exporter")]
pub async fn start_http_exporter(port: u16) -> Result<()> {
    let metrics_route = warp::path("metrics").and(warp::get()).map(|| {
        let body = gather_text().unwrap_or_default();
        warp::http::Response::builder()
            .header("Content-Type", TextEncoder::new().format_type())
            .body(body)
    });

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    tokio::spawn(async move {
        warp::serve(metrics_route).run(addr).await;
    });
    log::info!("Metrics exporter listening on {addr}");

    Ok(())
}

/// No-op when HTTP exporter feature is disabled.
#[cfg(not(feature = "http-exporter"))]
pub async fn start_http_exporter(_port: u16) -> Result<()> {
    log::warn!(
        "metrics::start_http_exporter called but 'http-exporter' feature is disabled; ignoring"
    );
    Ok(())
}
