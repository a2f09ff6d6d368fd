use anyhow::Context;
use clap::{Parser, ValueEnum};
use engine_cpu::BatchGeometry;
use engine_gpu::GpuConfig;
use miner_service::{build_backend, run_search, BackendConfig, EngineKind, SearchConfig, SearchError, SearchReport};
use pow_core::{format_hash, MessageTemplate, NonceSlot, Target};
use std::io::Read;
use std::path::PathBuf;
use std::time::Instant;

/// Largest stdin read; anything past a valid template is rejected anyway.
const STDIN_LIMIT: u64 = 4096;

const EXIT_FAILURE: i32 = 1;
const EXIT_EXHAUSTED: i32 = 3;
const EXIT_BAD_NONCE: i32 = 255;

/// BLAKE2s proof-of-work nonce search.
///
/// Reads the block template from stdin and prints
/// `<nonce> <total hashes> <hashes per second>` once a nonce whose hash is
/// at most TARGET has been found and verified.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target as 64 hex characters (byte i = hex pair i)
    #[arg(value_parser = parse_target)]
    target: Target,

    /// Device index within the selected platform
    #[arg(short, long, env = "MINER_DEVICE", default_value_t = 0)]
    device: usize,

    /// Platform index (distinct GPU backends in enumeration order)
    #[arg(short, long, env = "MINER_PLATFORM")]
    platform: Option<usize>,

    /// Lanes per workgroup
    #[arg(short = 'l', long, env = "MINER_LOCAL_SIZE", default_value_t = BatchGeometry::DEFAULT_LOCAL_SIZE)]
    local_size: u32,

    /// Nonces scanned by each lane
    #[arg(short = 'w', long, env = "MINER_WORK_SET", default_value_t = BatchGeometry::DEFAULT_LANES_PER_ITEM)]
    work_set: u64,

    /// Lanes per batch
    #[arg(short = 'g', long, env = "MINER_GLOBAL_SIZE", default_value_t = BatchGeometry::DEFAULT_GRID_SIZE)]
    global_size: u64,

    /// Kernel source to build instead of the built-in kernel
    #[arg(short, long, env = "MINER_KERNEL")]
    kernel: Option<PathBuf>,

    /// Start nonce in hex (random when omitted)
    #[arg(short, long, env = "MINER_NONCE", value_parser = parse_hex_nonce)]
    nonce: Option<u64>,

    /// Place the nonce in the last 8 bytes of the template instead of the first 8
    #[arg(short, long, env = "MINER_FINAL_NONCE")]
    final_nonce: bool,

    /// Enable verbose logging (debug output on stderr)
    #[arg(short, long, env = "MINER_VERBOSE")]
    verbose: bool,

    /// Search backend
    #[arg(long, env = "MINER_ENGINE", value_enum, default_value_t = EngineCli::Gpu)]
    engine: EngineCli,

    /// Worker threads for the CPU engine (defaults to all available)
    #[arg(long, env = "MINER_THREADS")]
    threads: Option<usize>,

    /// Give up after this many batches
    #[arg(long, env = "MINER_MAX_BATCHES")]
    max_batches: Option<u64>,

    /// Optional Prometheus metrics exporter port; if omitted, metrics are disabled
    #[arg(long, env = "MINER_METRICS_PORT")]
    metrics_port: Option<u16>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum EngineCli {
    /// GPU engine (WGPU based)
    Gpu,
    /// Host threads running the same per-nonce algorithm
    Cpu,
}

impl From<EngineCli> for EngineKind {
    fn from(value: EngineCli) -> Self {
        match value {
            EngineCli::Gpu => EngineKind::Gpu,
            EngineCli::Cpu => EngineKind::Cpu,
        }
    }
}

fn parse_target(s: &str) -> Result<Target, String> {
    s.parse::<Target>().map_err(|e| e.to_string())
}

fn parse_hex_nonce(s: &str) -> Result<u64, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex nonce '{s}': {e}"))
}

impl Args {
    fn slot(&self) -> NonceSlot {
        if self.final_nonce {
            NonceSlot::Trailing
        } else {
            NonceSlot::Leading
        }
    }

    fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            engine: self.engine.into(),
            gpu: GpuConfig {
                platform: self.platform,
                device: self.device,
                kernel: self.kernel.clone(),
            },
            cpu_threads: self.threads,
        }
    }

    fn search_config(&self) -> anyhow::Result<SearchConfig> {
        Ok(SearchConfig {
            geometry: BatchGeometry::new(self.global_size, self.local_size, self.work_set)?,
            slot: self.slot(),
            start_nonce: self.nonce,
            max_batches: self.max_batches,
            clock_start: None,
        })
    }
}

fn init_logger(verbose: bool) {
    // If RUST_LOG is not set, stay quiet unless asked for detail.
    let default = if verbose {
        "debug,miner=debug,gpu_engine=debug,engine_cpu=debug"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .target(env_logger::Target::Stderr)
        .init();
}

fn read_template(input: impl Read) -> anyhow::Result<MessageTemplate> {
    let mut buf = Vec::new();
    input
        .take(STDIN_LIMIT)
        .read_to_end(&mut buf)
        .context("failed to read template from stdin")?;
    log::debug!(target: "miner", "bufsize = {}", buf.len());
    Ok(MessageTemplate::new(&buf)?)
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<SearchError>() {
        Some(SearchError::Exhausted { .. }) => EXIT_EXHAUSTED,
        Some(SearchError::VerificationFailed { .. }) => EXIT_BAD_NONCE,
        _ => EXIT_FAILURE,
    }
}

async fn run(args: Args, started: Instant) -> anyhow::Result<SearchReport> {
    let template = read_template(std::io::stdin().lock())?;
    let config = SearchConfig {
        clock_start: Some(started),
        ..args.search_config()?
    };
    let backend_config = args.backend_config();

    log::debug!(target: "miner", "target = {}", format_hash(args.target.as_bytes()));
    log::info!(target: "miner", "Effective config: {config}");

    if let Some(port) = args.metrics_port {
        #[cfg(feature = "metrics")]
        metrics::start_http_exporter(port).await?;
        #[cfg(not(feature = "metrics"))]
        log::warn!(target: "miner", "metrics port {port} ignored: built without the 'metrics' feature");
    }

    let target = args.target;
    let report = tokio::task::spawn_blocking(move || -> anyhow::Result<SearchReport> {
        let mut backend = build_backend(&backend_config)?;
        log::debug!(target: "miner", "Started {} backend", backend.name());
        Ok(run_search(backend.as_mut(), config, &template, &target)?)
    })
    .await
    .context("search task panicked")??;

    Ok(report)
}

#[tokio::main]
async fn main() {
    // The reported rate includes template input and device setup.
    let started = Instant::now();
    let args = Args::parse();
    init_logger(args.verbose);

    match run(args, started).await {
        Ok(report) => println!("{report}"),
        Err(e) => {
            log::error!(target: "miner", "{e:#}");
            std::process::exit(exit_code(&e));
        }
    }
}
