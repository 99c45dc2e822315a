use anyhow::{ensure, Context, Result};
use blockjoin_core::{BlockFileWriter, InnerRow, JoinConfig, JoinEngine, JoinStrategy};
use clap::Parser;
use rand::prelude::*;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Times the serial and parallel join strategies", long_about = None)]
struct Args {
    /// Customer rows packed into the outer block file
    #[arg(long, default_value_t = 20_000)]
    outer_rows: usize,

    /// Order rows held in memory
    #[arg(long, default_value_t = 50_000)]
    inner_rows: usize,

    /// Distinct join keys the orders draw from
    #[arg(long, default_value_t = 20_000)]
    key_space: i64,

    /// Batch sizes to try, comma separated
    #[arg(long, value_delimiter = ',', default_value = "1,100,1000,10000")]
    batch_sizes: Vec<usize>,

    /// Timed iterations per configuration
    #[arg(long, default_value_t = 5)]
    iters: usize,

    /// Worker threads for the parallel strategy (default: available parallelism)
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long, default_value_t = 8192)]
    block_capacity: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    ensure!(args.key_space > 0, "--key-space must be positive");
    ensure!(args.iters > 0, "--iters must be positive");

    println!(
        "Starting Benchmark: {} customers, {} orders, {} keys, {} iters",
        args.outer_rows, args.inner_rows, args.key_space, args.iters
    );

    let mut rng = StdRng::seed_from_u64(args.seed);
    let dir = tempdir()?;
    let outer_path = dir.path().join("customer.dat");

    let start = Instant::now();
    write_customers(&outer_path, args.outer_rows, args.block_capacity)?;
    let inner = generate_orders(&mut rng, args.inner_rows, args.key_space);
    println!("Generated inputs in {:?}", start.elapsed());

    let mut expected: Option<u64> = None;
    for &batch_size in &args.batch_sizes {
        for strategy in [JoinStrategy::Serial, JoinStrategy::Parallel] {
            let config = JoinConfig::default()
                .with_block_capacity(args.block_capacity)
                .with_batch_size(batch_size)
                .with_strategy(strategy)
                .with_workers(args.workers);
            let engine = JoinEngine::new(config)?;
            let joined = measure_join(&engine, &outer_path, &inner, args.iters)?;

            match expected {
                None => expected = Some(joined),
                Some(count) => ensure!(
                    count == joined,
                    "{strategy} with batch size {batch_size} produced {joined} rows, expected {count}"
                ),
            }
        }
    }

    info!(joined_rows = expected.unwrap_or(0), "all configurations agree");
    Ok(())
}

/// Customer keys are `1..=rows`, matching `dbgen`'s dense custkeys.
fn write_customers(path: &Path, rows: usize, block_capacity: usize) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = BlockFileWriter::new(BufWriter::new(file), block_capacity)?;
    for key in 1..=rows {
        let record = format!("{key}|Customer#{key:09}|addr-{key}|{}|", key % 25);
        writer.write_record(record.as_bytes())?;
    }
    let (_, stats) = writer.finish()?;
    info!(
        records = stats.records,
        blocks = stats.blocks,
        bytes = stats.bytes,
        "outer relation packed"
    );
    Ok(())
}

fn generate_orders(rng: &mut StdRng, rows: usize, key_space: i64) -> Vec<InnerRow> {
    (0..rows)
        .map(|i| {
            let key = rng.gen_range(1..=key_space);
            InnerRow::new(i as i64 + 1, key, format!("order {i}"))
        })
        .collect()
}

/// Runs one warmup plus `iters` timed joins; returns the joined row count.
fn measure_join(
    engine: &JoinEngine,
    outer_path: &Path,
    inner: &[InnerRow],
    iters: usize,
) -> Result<u64> {
    let config = engine.config();
    print!(
        "{:>8} batch={:<6} workers={:<3}: ",
        config.strategy,
        config.effective_batch_size(),
        engine.effective_workers(config.effective_batch_size())
    );

    let warmup = engine.join_file(outer_path, inner)?;
    let joined = warmup.stats.joined_rows;

    let mut durs = Vec::with_capacity(iters);
    for _ in 0..iters {
        let start = Instant::now();
        let output = engine.join_file(outer_path, inner)?;
        durs.push(start.elapsed());
        ensure!(
            output.stats.joined_rows == joined,
            "join result changed between iterations"
        );
    }

    durs.sort();
    let p50 = percentile(&durs, 0.50);
    let p90 = percentile(&durs, 0.90);
    let p99 = percentile(&durs, 0.99);
    let avg = durs.iter().sum::<Duration>() / (durs.len() as u32);

    println!(
        "avg={:?} p50={:?} p90={:?} p99={:?} rows={}",
        avg, p50, p90, p99, joined
    );
    Ok(joined)
}

fn percentile(durs: &[Duration], quantile: f64) -> Duration {
    if durs.is_empty() {
        return Duration::from_millis(0);
    }
    let idx = ((durs.len() as f64 - 1.0) * quantile).round() as usize;
    durs[idx]
}
