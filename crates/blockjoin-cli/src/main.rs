//! `blockjoin`: joins a packed customer relation against in-memory orders,
//! and converts `.tbl` tables into the packed block format.

use anyhow::{ensure, Context, Result};
use blockjoin_core::{
    load_inner, load_outer, nested_loop_join, pack_table, write_joined, JoinConfig, JoinEngine,
    JoinStats, JoinStrategy, JoinedRow,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "blockjoin")]
#[command(author, version, about = "Block nested loop join over packed tables", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Join customers against orders on the customer key
    Join(JoinArgs),
    /// Convert a `|`-delimited table into the packed block format
    Pack(PackArgs),
}

/// Settings shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
struct ConfigArgs {
    /// JSON file with a join configuration; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,
    /// Bytes per on-disk block (must match the value used when packing)
    #[arg(long)]
    block_capacity: Option<usize>,
}

impl ConfigArgs {
    fn load(&self) -> Result<JoinConfig> {
        let mut config = match &self.config {
            Some(path) => JoinConfig::from_json_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => JoinConfig::default(),
        };
        if let Some(capacity) = self.block_capacity {
            config = config.with_block_capacity(capacity);
        }
        Ok(config)
    }
}

#[derive(ValueEnum, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Mode {
    /// Scan the packed outer file block by block
    Disk,
    /// Load the outer table and join it in memory with the batched engine
    Memory,
    /// Naive nested loop join, no batching
    Simple,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Disk => "disk",
            Mode::Memory => "memory",
            Mode::Simple => "simple",
        }
    }
}

#[derive(Args, Debug)]
struct JoinArgs {
    /// Directory holding customer.dat, customer.tbl and orders.tbl
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,
    /// Packed outer relation (default: <data-dir>/customer.dat)
    #[arg(long)]
    outer_dat: Option<PathBuf>,
    /// Outer table for the memory and simple modes (default: <data-dir>/customer.tbl)
    #[arg(long)]
    outer_tbl: Option<PathBuf>,
    /// Inner table (default: <data-dir>/orders.tbl)
    #[arg(long)]
    inner_tbl: Option<PathBuf>,
    #[arg(short, long, value_enum, default_value_t = Mode::Disk)]
    mode: Mode,
    /// serial or parallel
    #[arg(short, long)]
    strategy: Option<JoinStrategy>,
    /// Outer rows per batch (0 selects the default)
    #[arg(short, long)]
    batch_size: Option<usize>,
    /// Worker threads per batch for the parallel strategy
    #[arg(short, long)]
    workers: Option<usize>,
    /// Load at most this many outer rows (memory and simple modes only)
    #[arg(long)]
    max_outer: Option<usize>,
    /// Load at most this many inner rows
    #[arg(long)]
    max_inner: Option<usize>,
    /// Where to write the joined rows
    #[arg(short, long, default_value = "output/result.tbl")]
    output: PathBuf,
    /// Skip writing the joined rows
    #[arg(long)]
    no_output: bool,
    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
    #[command(flatten)]
    common: ConfigArgs,
}

impl JoinArgs {
    fn resolve_config(&self) -> Result<JoinConfig> {
        ensure!(
            self.mode != Mode::Disk || self.max_outer.is_none(),
            "--max-outer applies to the memory and simple modes; the disk mode scans the whole packed file"
        );
        let mut config = self.common.load()?;
        if let Some(strategy) = self.strategy {
            config = config.with_strategy(strategy);
        }
        if let Some(batch_size) = self.batch_size {
            config = config.with_batch_size(batch_size);
        }
        if self.workers.is_some() {
            config = config.with_workers(self.workers);
        }
        config.validate()?;
        Ok(config)
    }

    fn outer_dat(&self) -> PathBuf {
        self.outer_dat
            .clone()
            .unwrap_or_else(|| self.data_dir.join("customer.dat"))
    }

    fn outer_tbl(&self) -> PathBuf {
        self.outer_tbl
            .clone()
            .unwrap_or_else(|| self.data_dir.join("customer.tbl"))
    }

    fn inner_tbl(&self) -> PathBuf {
        self.inner_tbl
            .clone()
            .unwrap_or_else(|| self.data_dir.join("orders.tbl"))
    }
}

#[derive(Args, Debug)]
struct PackArgs {
    /// Source table
    input: PathBuf,
    /// Packed block file to create
    output: PathBuf,
    #[command(flatten)]
    common: ConfigArgs,
}

#[derive(Serialize, Debug)]
struct RunReport {
    mode: Mode,
    outer_rows: u64,
    inner_rows: u64,
    joined_rows: u64,
    load_ms: u64,
    join_ms: u64,
    /// Inputs that could not be read and were joined as empty relations.
    unreadable: Vec<PathBuf>,
    /// Engine counters; absent for the simple mode.
    stats: Option<JoinStats>,
}

/// An unreadable table is joined as an empty relation; parse errors stay fatal.
fn recover_unreadable<T>(
    relation: &str,
    path: &Path,
    loaded: blockjoin_core::Result<Vec<T>>,
    unreadable: &mut Vec<PathBuf>,
) -> Result<Vec<T>> {
    match loaded {
        Ok(rows) => Ok(rows),
        Err(e) if e.is_io() => {
            warn!(relation, path = %path.display(), error = %e, "cannot open table - joining with no rows");
            unreadable.push(path.to_path_buf());
            Ok(Vec::new())
        }
        Err(e) => Err(e).with_context(|| format!("loading {relation} relation {}", path.display())),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if std::env::var("BLOCKJOIN_LOG_FORMAT").unwrap_or_default() == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Join(args) => run_join(&args),
        Commands::Pack(args) => run_pack(&args),
    }
}

fn run_join(args: &JoinArgs) -> Result<()> {
    let config = args.resolve_config()?;
    let batch_size = config.effective_batch_size();
    let engine = JoinEngine::new(config)?;

    let mut unreadable = Vec::new();
    let load_start = Instant::now();
    let inner_path = args.inner_tbl();
    let inner = recover_unreadable(
        "inner",
        &inner_path,
        load_inner(&inner_path, args.max_inner),
        &mut unreadable,
    )?;
    let outer = match args.mode {
        Mode::Disk => Vec::new(),
        Mode::Memory | Mode::Simple => {
            let outer_path = args.outer_tbl();
            recover_unreadable(
                "outer",
                &outer_path,
                load_outer(&outer_path, args.max_outer),
                &mut unreadable,
            )?
        }
    };
    let load_ms = load_start.elapsed().as_millis() as u64;

    let join_start = Instant::now();
    let (rows, stats): (Vec<JoinedRow>, Option<JoinStats>) = match args.mode {
        Mode::Disk => {
            let outer_path = args.outer_dat();
            let output = engine
                .join_file(&outer_path, &inner)
                .with_context(|| format!("joining {}", outer_path.display()))?;
            if output.stats.source_unreadable {
                unreadable.push(outer_path);
            }
            (output.rows, Some(output.stats))
        }
        Mode::Memory => {
            let output = engine.join_rows(&outer, &inner)?;
            (output.rows, Some(output.stats))
        }
        Mode::Simple => (nested_loop_join(&outer, &inner), None),
    };
    let join_ms = join_start.elapsed().as_millis() as u64;

    let report = RunReport {
        mode: args.mode,
        outer_rows: match (&stats, args.mode) {
            (Some(stats), Mode::Disk) => stats.outer_rows,
            _ => outer.len() as u64,
        },
        inner_rows: inner.len() as u64,
        joined_rows: rows.len() as u64,
        load_ms,
        join_ms,
        unreadable,
        stats,
    };

    if !args.no_output {
        write_output(&args.output, &rows)?;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Loaded customers={} orders={}",
            report.outer_rows, report.inner_rows
        );
        println!("Join rows: {}", report.joined_rows);
        println!("Load time: {} ms", report.load_ms);
        println!("Join time: {} ms", report.join_ms);
        match &report.stats {
            Some(stats) => println!(
                "Mode: {} (strategy {}, batch size {}, {} batches)",
                args.mode.as_str(),
                stats.strategy,
                batch_size,
                stats.batches
            ),
            None => println!("Mode: {}", args.mode.as_str()),
        }
        for path in &report.unreadable {
            println!("Warning: {} could not be read", path.display());
        }
    }
    Ok(())
}

fn write_output(path: &Path, rows: &[JoinedRow]) -> Result<()> {
    write_joined(path, rows).with_context(|| format!("writing {}", path.display()))
}

fn run_pack(args: &PackArgs) -> Result<()> {
    let config = args.common.load()?;
    let stats = pack_table(&args.input, &args.output, &config).with_context(|| {
        format!(
            "packing {} into {}",
            args.input.display(),
            args.output.display()
        )
    })?;
    println!(
        "Converted: {} -> {}",
        args.input.display(),
        args.output.display()
    );
    println!(
        "records={} blocks={} bytes={} block_capacity={}",
        stats.records, stats.blocks, stats.bytes, config.block_capacity
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::fs;
    use tempfile::tempdir;

    fn join_args(argv: &[&str]) -> JoinArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Commands::Join(args) => args,
            other => panic!("expected join, got {other:?}"),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn join_defaults() {
        let args = join_args(&["blockjoin", "join"]);
        assert_eq!(args.mode, Mode::Disk);
        assert_eq!(args.outer_dat(), PathBuf::from("data/customer.dat"));
        assert_eq!(args.inner_tbl(), PathBuf::from("data/orders.tbl"));
        assert_eq!(args.output, PathBuf::from("output/result.tbl"));
        assert_eq!(args.resolve_config().unwrap(), JoinConfig::default());
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("join.json");
        fs::write(
            &path,
            r#"{"batch_size": 50, "strategy": "serial", "block_capacity": 4096}"#,
        )
        .unwrap();

        let args = join_args(&[
            "blockjoin",
            "join",
            "--config",
            path.to_str().unwrap(),
            "--strategy",
            "PARALLEL",
            "--workers",
            "3",
        ]);
        let config = args.resolve_config().unwrap();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.block_capacity, 4096);
        assert_eq!(config.strategy, JoinStrategy::Parallel);
        assert_eq!(config.workers, Some(3));
    }

    #[test]
    fn bad_flags_are_rejected() {
        assert!(Cli::try_parse_from(["blockjoin", "join", "--strategy", "hash"]).is_err());
        assert!(Cli::try_parse_from(["blockjoin", "join", "--mode", "index"]).is_err());
        let args = join_args(&["blockjoin", "join", "--workers", "0"]);
        assert!(args.resolve_config().is_err());
    }

    #[test]
    fn max_outer_is_rejected_for_disk_mode() {
        let args = join_args(&["blockjoin", "join", "--max-outer", "10"]);
        let err = args.resolve_config().unwrap_err();
        assert!(err.to_string().contains("--max-outer"), "{err}");

        let args = join_args(&["blockjoin", "join", "--mode", "memory", "--max-outer", "10"]);
        assert!(args.resolve_config().is_ok());
    }

    #[test]
    fn missing_tables_join_as_empty_relations() {
        let dir = tempdir().unwrap();
        let data = dir.path();
        fs::write(data.join("customer.tbl"), "1|Alice|\n2|Bob|\n").unwrap();
        let output = data.join("result.tbl");

        for mode in ["disk", "memory", "simple"] {
            let args = join_args(&[
                "blockjoin",
                "join",
                "--data-dir",
                data.to_str().unwrap(),
                "--mode",
                mode,
                "--output",
                output.to_str().unwrap(),
            ]);
            run_join(&args).unwrap();
            assert_eq!(fs::read_to_string(&output).unwrap(), "", "mode={mode}");
        }

        let mut unreadable = Vec::new();
        let rows = recover_unreadable(
            "inner",
            &data.join("orders.tbl"),
            load_inner(&data.join("orders.tbl"), None),
            &mut unreadable,
        )
        .unwrap();
        assert!(rows.is_empty());
        assert_eq!(unreadable, vec![data.join("orders.tbl")]);
    }

    #[test]
    fn malformed_table_still_fails_the_join() {
        let dir = tempdir().unwrap();
        let data = dir.path();
        fs::write(data.join("customer.tbl"), "1|Alice|\n").unwrap();
        fs::write(data.join("orders.tbl"), "not-a-key|1|\n").unwrap();
        let args = join_args(&[
            "blockjoin",
            "join",
            "--data-dir",
            data.to_str().unwrap(),
            "--mode",
            "memory",
            "--no-output",
        ]);
        let err = run_join(&args).unwrap_err();
        assert!(format!("{err:#}").contains("parse error at line 1"), "{err:#}");
    }

    #[test]
    fn pack_then_join_from_disk() {
        let dir = tempdir().unwrap();
        let data = dir.path();
        fs::write(data.join("customer.tbl"), "1|Alice|\n2|Bob|\n").unwrap();
        fs::write(
            data.join("orders.tbl"),
            "100|1|O|1.0|1996-01-02|5-LOW|Clerk#1|0|rush|\n\
             101|2|O|1.0|1996-01-02|5-LOW|Clerk#1|0|urgent|\n\
             102|1|O|1.0|1996-01-02|5-LOW|Clerk#1|0|fast|\n",
        )
        .unwrap();

        run_pack(&PackArgs {
            input: data.join("customer.tbl"),
            output: data.join("customer.dat"),
            common: ConfigArgs::default(),
        })
        .unwrap();

        let output = data.join("out/result.tbl");
        let args = join_args(&[
            "blockjoin",
            "join",
            "--data-dir",
            data.to_str().unwrap(),
            "--batch-size",
            "1",
            "--output",
            output.to_str().unwrap(),
        ]);
        run_join(&args).unwrap();

        let mut lines: Vec<String> = fs::read_to_string(&output)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        lines.sort();
        assert_eq!(
            lines,
            vec!["1|Alice|100|rush", "1|Alice|102|fast", "2|Bob|101|urgent"]
        );
    }
}
