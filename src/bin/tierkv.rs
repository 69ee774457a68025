//! tierkv Binary
//!
//! Operates on a pool image file: reads, writes, bulk loads and checks.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tierkv::maintenance::Maintenance;
use tierkv::tiering::{MemoryPolicy, RatioWeights};
use tierkv::{Config, Engine};
use tracing_subscriber::{fmt, EnvFilter};

/// tierkv
#[derive(Parser, Debug)]
#[command(name = "tierkv")]
#[command(about = "DRAM/PMEM tiered key-value persistence core")]
#[command(version)]
struct Args {
    /// Pool image file
    #[arg(short, long, default_value = "./tierkv.pool")]
    pool: PathBuf,

    /// Pool size in MB (used when the pool is created)
    #[arg(short = 's', long, default_value = "64")]
    pool_mb: usize,

    /// Memory policy: only-dram, only-pmem, threshold or ratio
    #[arg(long, default_value = "only-dram")]
    policy: MemoryPolicy,

    /// Target DRAM:PMEM ratio for the ratio policy
    #[arg(long, default_value = "1:3")]
    ratio: RatioWeights,

    /// Threshold in bytes for the threshold policy
    #[arg(long, default_value = "64")]
    threshold: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Set {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Delete a key
    Del {
        /// The key to delete
        key: String,
    },

    /// Write generated keys while the maintenance thread adjusts the threshold
    Load {
        /// Number of keys to write
        #[arg(short, long, default_value = "10000")]
        count: usize,

        /// Largest value size in bytes
        #[arg(long, default_value = "512")]
        max_value: usize,
    },

    /// Check the persistent list against the in-memory table
    Verify,

    /// Print usage and tiering state
    Stats,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tierkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("tierkv v{}", tierkv::VERSION);
    tracing::info!("Pool image: {}", args.pool.display());

    let config = Config::builder()
        .pool_path(&args.pool)
        .pool_size(args.pool_mb * 1024 * 1024)
        .memory_alloc_policy(args.policy)
        .dram_pmem_ratio(args.ratio.dram, args.ratio.pmem)
        .static_threshold(args.threshold)
        .build();

    let engine = match Engine::open(config) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!("Failed to open engine: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(engine, args.command) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(engine: Engine, command: Commands) -> tierkv::Result<()> {
    match command {
        Commands::Get { key } => match engine.get(key.as_bytes()) {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(nil)"),
        },
        Commands::Set { key, value } => {
            let outcome = engine.set(key.as_bytes(), value.as_bytes())?;
            println!("OK ({:?})", outcome);
        }
        Commands::Del { key } => {
            let existed = engine.delete(key.as_bytes())?;
            println!("{}", if existed { 1 } else { 0 });
        }
        Commands::Load { count, max_value } => {
            let engine = Arc::new(engine);
            let maintenance = Maintenance::start(Arc::clone(&engine))?;

            for i in 0..count {
                let key = format!("key:{:08}", i);
                let value = vec![b'v'; value_size(i, max_value)];
                engine.set(key.as_bytes(), &value)?;
            }

            let ticks = maintenance.stop();
            print_stats(&engine);
            println!("maintenance ticks: {}", ticks);

            let engine = Arc::try_unwrap(engine).map_err(|_| {
                tierkv::TierError::InvalidArgument("engine still shared after load".to_string())
            })?;
            return engine.close();
        }
        Commands::Verify => {
            let report = engine.verify()?;
            println!("OK: {} entries, all links consistent", report.reachable);
        }
        Commands::Stats => print_stats(&engine),
    }

    engine.close()
}

/// Spread sizes over 1..=max with a cheap multiplicative hash
fn value_size(i: usize, max: usize) -> usize {
    let mixed = (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32;
    1 + (mixed as usize) % max.max(1)
}

fn print_stats(engine: &Engine) {
    let usage = engine.usage();
    let tiering = engine.tiering_snapshot();
    println!("keys:       {}", engine.entry_count());
    println!("dram bytes: {}", usage.dram);
    println!("pmem bytes: {}", usage.pmem);
    println!("pool bytes: {}", engine.pool_used_bytes());
    println!("policy:     {}", tiering.policy);
    println!("threshold:  {}", tiering.threshold);
    println!("ratio:      {}", tiering.ratio);
}
