use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use flash_mev::hint::{cpu_relax, cycles};
use flash_mev::registry::TX_BLOCK_SIZE;
use flash_mev::{rlp, Detector, Opportunity, Pipeline, PipelineConfig, SizeClass};
use hdrhistogram::Histogram;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn Error + Send + Sync>;

/// Measure detector -> executor hand-off latency through the pipeline.
#[derive(Parser, Debug)]
#[command(name = "latency-report")]
struct Args {
    /// Number of detector threads
    #[arg(long, default_value_t = 4)]
    producers: u16,

    /// Opportunities submitted by each detector
    #[arg(long, default_value_t = 250_000)]
    per_producer: u64,

    /// Pipeline config file (TOML); defaults are used when absent
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "flash_mev=debug"
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Cycle counter ticks per nanosecond, measured against the wall clock.
fn cycles_per_ns() -> f64 {
    let start = Instant::now();
    let c0 = cycles();
    thread::sleep(Duration::from_millis(20));
    let c1 = cycles();
    let ns = start.elapsed().as_nanos() as f64;
    (c1.wrapping_sub(c0) as f64 / ns).max(1e-3)
}

/// Fill tx blocks with an RLP-encoded counter and push them, spinning
/// while the queue is full.
fn produce(mut detector: Detector, count: u64) -> Result<u64, BoxError> {
    let mut retries = 0u64;
    for n in 0..count {
        let mut block = detector.acquire(TX_BLOCK_SIZE)?;
        let mut value = [0u8; 32];
        value[24..].copy_from_slice(&n.to_be_bytes());
        let len = rlp::encode_uint256(&value, &mut block)?;

        loop {
            match detector.submit(block, len) {
                Ok(()) => break,
                Err(err) => {
                    block = err.into_block();
                    retries += 1;
                    cpu_relax();
                }
            }
        }
    }
    Ok(retries)
}

fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .init();

    let config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    println!("Preparing Latency Benchmark...");
    let mut pipeline = Pipeline::new(config)?;
    let mut executor = pipeline.take_executor().ok_or("executor already taken")?;
    let ticks_per_ns = cycles_per_ns();

    let stop = Arc::new(AtomicBool::new(false));
    let mut histogram = Histogram::<u64>::new_with_bounds(1, 100_000_000, 3)?;

    let consumer = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let processed = executor.run_until(&stop, &mut |opp: &Opportunity| {
                let elapsed = cycles().wrapping_sub(opp.detected_at);
                histogram.saturating_record((elapsed as f64 / ticks_per_ns) as u64);
            });
            (histogram, processed)
        })
    };

    println!(
        "Running {} detectors x {} opportunities...",
        args.producers, args.per_producer
    );
    let started = Instant::now();
    let producers: Vec<_> = (0..args.producers)
        .map(|id| {
            let detector = pipeline.detector(id);
            let count = args.per_producer;
            thread::spawn(move || produce(detector, count))
        })
        .collect();

    let mut retries = 0;
    for handle in producers {
        retries += handle.join().map_err(|_| "detector thread panicked")??;
    }
    stop.store(true, Ordering::Release);
    let (histogram, processed) = consumer.join().map_err(|_| "executor thread panicked")?;
    let elapsed = started.elapsed();

    println!("\n=== Hand-off Latency Report (ns) ===");
    println!("Total Ops:  {}", processed);
    println!("Throughput: {:.2} ops/sec", processed as f64 / elapsed.as_secs_f64());
    println!("Full-queue retries: {}", retries);
    println!("------------------------------------");
    println!("Min:    {:8} ns", histogram.min());
    println!("P50:    {:8} ns", histogram.value_at_quantile(0.50));
    println!("P90:    {:8} ns", histogram.value_at_quantile(0.90));
    println!("P99:    {:8} ns", histogram.value_at_quantile(0.99));
    println!("P99.9:  {:8} ns", histogram.value_at_quantile(0.999));
    println!("P99.99: {:8} ns", histogram.value_at_quantile(0.9999));
    println!("Max:    {:8} ns", histogram.max());
    println!("------------------------------------");

    println!("\nPools:");
    for class in SizeClass::ALL {
        let stats = pipeline.registry().pool_stats(class);
        println!(
            "{:>9}: {:5} free / {:5} max, {:8} fallback allocs, {:8} overflow frees, {:8} contended frees",
            class.to_string(),
            stats.free,
            stats.max_blocks,
            stats.fallback_allocs,
            stats.overflow_frees,
            stats.contended_frees
        );
    }

    println!("\nDistribution:");
    for v in histogram.iter_log(100, 2.0) {
        let count = v.count_since_last_iteration();
        if count > 0 {
            println!("<= {:10} ns: {:10} count", v.value_iterated_to(), count);
        }
    }

    Ok(())
}
