// SPDX-License-Identifier: AGPL-3.0-only

//! Ring throughput under concurrent submitters.
//!
//! Drives the full submit / build / start / complete path against the
//! register-level engine model, so the numbers measure driver overhead
//! (locking, descriptor building, completion crediting) rather than link
//! bandwidth.
//!
//! ```text
//!   bench_ring --threads 4 --requests 2000 --descriptors 24 --len 4096
//!   bench_ring --direction c2h --streaming --depth 32
//!   bench_ring --poll
//! ```

use anyhow::{ensure, Context, Result};
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use xdma_driver::prelude::*;
use xdma_driver::sim::{SimMemory, SimulatedEngine};

#[derive(Clone, Copy, ValueEnum)]
enum Dir {
    H2c,
    C2h,
}

impl From<Dir> for Direction {
    fn from(d: Dir) -> Self {
        match d {
            Dir::H2c => Self::H2C,
            Dir::C2h => Self::C2H,
        }
    }
}

#[derive(Parser)]
#[command(name = "bench_ring", about = "DMA ring throughput on the simulated engine")]
struct Args {
    /// Transfer direction.
    #[arg(long, value_enum, default_value = "h2c")]
    direction: Dir,
    /// Descriptor sets in the ring.
    #[arg(long, default_value_t = 8)]
    sets: u32,
    /// Descriptors per set (16, 32, 64 or 128).
    #[arg(long, default_value_t = 32)]
    depth: u32,
    /// Submitting threads.
    #[arg(long, default_value_t = 4)]
    threads: u32,
    /// Requests per thread.
    #[arg(long, default_value_t = 500)]
    requests: u32,
    /// Scatter entries per request.
    #[arg(long, default_value_t = 16)]
    descriptors: u32,
    /// Bytes per scatter entry.
    #[arg(long, default_value_t = 4096)]
    len: u32,
    /// Detect completion by polling the write-back word.
    #[arg(long)]
    poll: bool,
    /// Model a streaming user interface.
    #[arg(long)]
    streaming: bool,
    /// Per-request timeout in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,
}

#[allow(clippy::cast_precision_loss)]
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();
    ensure!(args.threads > 0 && args.requests > 0, "need at least one thread and one request");
    let direction = Direction::from(args.direction);
    let per_thread = u64::from(args.descriptors) * u64::from(args.len);
    let card_bytes = usize::try_from(per_thread * u64::from(args.threads))
        .context("card size overflows usize")?;

    let mem = Arc::new(SimMemory::with_card_size(card_bytes.max(4096)));
    let sim = Arc::new(SimulatedEngine::new(mem.clone(), direction, 0).streaming(args.streaming));
    let mut config = EngineConfig::new(direction, 0)
        .with_set_count(args.sets)
        .with_set_depth(args.depth)
        .with_request_timeout(Duration::from_millis(args.timeout_ms));
    if args.poll {
        config = config.with_completion_mode(CompletionMode::Poll);
    }
    if args.streaming {
        config = config.with_stream_buffer_bytes(args.len);
    }

    let engine = Arc::new(Engine::new(config, sim.clone(), mem.as_ref())?);
    sim.connect_irq(engine.irq_handle());
    let mut worker = CompletionWorker::spawn(engine.clone(), Duration::from_millis(1))?;
    tracing::info!(
        "{}: max desc {} bytes, {:?} completion",
        engine.name(),
        engine.max_desc_len(),
        engine.config().completion_mode
    );

    println!("DMA ring benchmark ({})", engine.name());
    println!("================================");
    println!(
        "  ring {} x {}, {} threads x {} requests x {} x {} B",
        args.sets, args.depth, args.threads, args.requests, args.descriptors, args.len
    );
    println!();

    let start = Instant::now();
    let handles: Vec<_> = (0..args.threads)
        .map(|t| -> Result<_> {
            let list: Vec<ScatterEntry> = (0..args.descriptors)
                .map(|_| {
                    mem.alloc_buffer(args.len as usize)
                        .map(|b| ScatterEntry::new(b.bus_addr(), args.len))
                })
                .collect::<std::result::Result<_, _>>()?;
            let engine = engine.clone();
            let requests = args.requests;
            let offset = u64::from(t) * per_thread;
            Ok(std::thread::spawn(move || -> Result<(u64, Vec<Duration>)> {
                let mut bytes = 0u64;
                let mut latencies = Vec::with_capacity(requests as usize);
                tracing::debug!("submitter {t} at device offset {offset:#x}");
                for _ in 0..requests {
                    let t0 = Instant::now();
                    let n = engine.submit(direction, offset, &list, None, None)?;
                    latencies.push(t0.elapsed());
                    bytes += n as u64;
                }
                tracing::info!("submitter {t} done: {bytes} bytes");
                Ok((bytes, latencies))
            }))
        })
        .collect::<Result<_>>()?;

    let mut total_bytes = 0u64;
    let mut latencies = Vec::new();
    for h in handles {
        let (bytes, lat) = h
            .join()
            .map_err(|_| anyhow::anyhow!("submitter thread panicked"))??;
        total_bytes += bytes;
        latencies.extend(lat);
    }
    let elapsed = start.elapsed();
    worker.stop();
    tracing::info!("{} requests in {elapsed:?}", latencies.len());

    let expected = per_thread * u64::from(args.threads) * u64::from(args.requests);
    ensure!(
        total_bytes == expected,
        "moved {total_bytes} bytes, expected {expected}"
    );

    latencies.sort_unstable();
    let pct = |p: usize| latencies[(latencies.len() - 1) * p / 100];
    let secs = elapsed.as_secs_f64();
    let mb_s = total_bytes as f64 / secs / 1e6;

    println!("  elapsed      {elapsed:>12.3?}");
    println!("  throughput   {mb_s:>12.1} MB/s");
    println!("  requests/s   {:>12.0}", latencies.len() as f64 / secs);
    println!("  latency p50  {:>12.1?}", pct(50));
    println!("  latency p99  {:>12.1?}", pct(99));
    println!();

    let stats = engine.stats();
    let snap = engine.ring_snapshot();
    println!("  hw starts        {:>10}", stats.hw_starts);
    println!("  sets closed      {:>10}", stats.sets_closed);
    println!("  ring full events {:>10}", stats.ring_full_events);
    println!("  busy retries     {:>10}", stats.start_busy_retries);
    println!("  services         {:>10}", stats.services);
    println!(
        "  desc per start   {:>10.1}",
        stats.descriptors_completed as f64 / stats.hw_starts.max(1) as f64
    );
    if stats.unattributed > 0 {
        tracing::warn!("{} completed descriptors were not attributed", stats.unattributed);
    }
    ensure!(snap.is_drained(), "ring not drained: {snap:?}");

    Ok(())
}
