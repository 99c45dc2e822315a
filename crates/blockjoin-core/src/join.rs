//! Block Nested Loop Join
//!
//! Joins logical batches of the outer relation against a fully resident inner
//! relation, either on the calling thread or across a fresh set of scoped
//! workers per batch.

use std::any::Any;
use std::ops::Range;
use std::path::Path;
use std::thread;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::aggregate::ResultAggregator;
use crate::config::{JoinConfig, JoinStrategy};
use crate::error::{BlockJoinError, Result};
use crate::relation::{InnerRow, JoinedRow, OuterRow};
use crate::scan::scan;

// ============================================================================
// Results
// ============================================================================

/// Counters for one join invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinStats {
    pub strategy: JoinStrategy,
    pub batch_size: usize,
    pub batches: u64,
    pub outer_rows: u64,
    pub inner_rows: u64,
    pub joined_rows: u64,
    pub blocks_read: u64,
    /// Worker tasks run across all batches (a serial batch counts as one).
    pub worker_tasks: u64,
    /// The outer file could not be opened; the output is empty.
    pub source_unreadable: bool,
    pub elapsed_ms: u64,
}

/// What one batch contributed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub outer_rows: usize,
    pub joined_rows: usize,
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct JoinOutput {
    pub rows: Vec<JoinedRow>,
    pub stats: JoinStats,
}

// ============================================================================
// Kernels
// ============================================================================

/// Naive fully in-memory nested loop join, kept as a baseline.
pub fn nested_loop_join(outer: &[OuterRow], inner: &[InnerRow]) -> Vec<JoinedRow> {
    let mut out = Vec::with_capacity(outer.len());
    join_serial(outer, inner, &mut out);
    out
}

/// Outer-major loop: output follows outer order, then inner order.
fn join_serial(batch: &[OuterRow], inner: &[InnerRow], out: &mut Vec<JoinedRow>) {
    for outer in batch {
        for row in inner {
            if outer.key == row.key {
                out.push(JoinedRow::new(outer, row));
            }
        }
    }
}

/// Inner-major loop used by a worker: one pass over the inner relation,
/// probing only the worker's own slice.
fn join_slice(slice: &[OuterRow], inner: &[InnerRow]) -> Vec<JoinedRow> {
    let mut local = Vec::new();
    for row in inner {
        for outer in slice {
            if outer.key == row.key {
                local.push(JoinedRow::new(outer, row));
            }
        }
    }
    local
}

/// Splits `len` rows into contiguous slices of `ceil(len / workers)` rows.
///
/// Falls back to one slice covering everything when there are fewer rows
/// than workers or when some worker would end up with nothing.
pub fn partition_ranges(len: usize, workers: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    let workers = workers.max(1);
    if workers == 1 || len < workers {
        return vec![0..len];
    }
    let chunk = (len + workers - 1) / workers;
    let ranges: Vec<Range<usize>> = (0..len)
        .step_by(chunk)
        .map(|start| start..(start + chunk).min(len))
        .collect();
    if ranges.len() < workers {
        return vec![0..len];
    }
    ranges
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct JoinEngine {
    config: JoinConfig,
    workers: usize,
}

impl JoinEngine {
    pub fn new(config: JoinConfig) -> Result<Self> {
        config.validate()?;
        let workers = match config.strategy {
            JoinStrategy::Serial => 1,
            JoinStrategy::Parallel => config.resolved_workers(),
        };
        Ok(Self { config, workers })
    }

    pub fn config(&self) -> &JoinConfig {
        &self.config
    }

    /// Worker count the engine would use for a batch of `batch_len` rows.
    pub fn effective_workers(&self, batch_len: usize) -> usize {
        partition_ranges(batch_len, self.workers).len().max(1)
    }

    /// Joins one batch and merges its matches into `out`.
    ///
    /// Returns once every worker of this batch has finished. A worker that
    /// panics fails the call and nothing from this batch is merged.
    pub fn join_batch(
        &self,
        batch: &[OuterRow],
        inner: &[InnerRow],
        out: &ResultAggregator,
    ) -> Result<BatchReport> {
        self.join_batch_with(batch, inner, out, join_slice)
    }

    /// `join_batch` with the per-worker kernel supplied by the caller.
    fn join_batch_with<K>(
        &self,
        batch: &[OuterRow],
        inner: &[InnerRow],
        out: &ResultAggregator,
        kernel: K,
    ) -> Result<BatchReport>
    where
        K: Fn(&[OuterRow], &[InnerRow]) -> Vec<JoinedRow> + Sync,
    {
        if batch.is_empty() || inner.is_empty() {
            return Ok(BatchReport {
                outer_rows: batch.len(),
                ..BatchReport::default()
            });
        }

        let ranges = partition_ranges(batch.len(), self.workers);
        if ranges.len() <= 1 {
            let mut local = Vec::new();
            join_serial(batch, inner, &mut local);
            let joined_rows = local.len();
            out.merge(local);
            return Ok(BatchReport {
                outer_rows: batch.len(),
                joined_rows,
                workers: 1,
            });
        }

        let results: Vec<thread::Result<Vec<JoinedRow>>> = thread::scope(|s| {
            let handles: Vec<_> = ranges
                .iter()
                .map(|range| {
                    let slice = &batch[range.clone()];
                    let kernel = &kernel;
                    s.spawn(move || kernel(slice, inner))
                })
                .collect();
            handles.into_iter().map(|h| h.join()).collect()
        });

        let mut partials = Vec::with_capacity(results.len());
        for (worker, result) in results.into_iter().enumerate() {
            let partial = result.map_err(|payload| BlockJoinError::Worker {
                worker,
                reason: panic_message(payload.as_ref()),
            })?;
            partials.push(partial);
        }

        let workers = partials.len();
        let mut joined_rows = 0;
        for partial in partials {
            joined_rows += partial.len();
            out.merge(partial);
        }
        Ok(BatchReport {
            outer_rows: batch.len(),
            joined_rows,
            workers,
        })
    }

    fn new_stats(&self, inner: &[InnerRow]) -> JoinStats {
        JoinStats {
            strategy: self.config.strategy,
            batch_size: self.config.effective_batch_size(),
            batches: 0,
            outer_rows: 0,
            inner_rows: inner.len() as u64,
            joined_rows: 0,
            blocks_read: 0,
            worker_tasks: 0,
            source_unreadable: false,
            elapsed_ms: 0,
        }
    }

    fn run_batch(
        &self,
        batch: &[OuterRow],
        inner: &[InnerRow],
        out: &ResultAggregator,
        stats: &mut JoinStats,
    ) -> Result<()> {
        let report = self.join_batch(batch, inner, out)?;
        debug!(
            batch = stats.batches,
            outer_rows = report.outer_rows,
            joined_rows = report.joined_rows,
            workers = report.workers,
            "batch joined"
        );
        stats.batches += 1;
        stats.outer_rows += report.outer_rows as u64;
        stats.joined_rows += report.joined_rows as u64;
        stats.worker_tasks += report.workers as u64;
        Ok(())
    }

    fn finish(&self, mut stats: JoinStats, out: ResultAggregator, start: Instant) -> JoinOutput {
        stats.elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            strategy = %stats.strategy,
            batch_size = stats.batch_size,
            batches = stats.batches,
            outer_rows = stats.outer_rows,
            inner_rows = stats.inner_rows,
            joined_rows = stats.joined_rows,
            elapsed_ms = stats.elapsed_ms,
            "join complete"
        );
        JoinOutput {
            rows: out.into_rows(),
            stats,
        }
    }

    /// Block nested loop join over a packed outer file.
    ///
    /// An empty inner relation returns before the file is touched. A file
    /// that cannot be opened yields an empty result flagged in the stats.
    pub fn join_file(&self, path: &Path, inner: &[InnerRow]) -> Result<JoinOutput> {
        let start = Instant::now();
        let mut stats = self.new_stats(inner);
        let out = ResultAggregator::new();

        if inner.is_empty() {
            info!(path = %path.display(), "inner relation is empty - skipping outer scan");
            return Ok(self.finish(stats, out, start));
        }

        let mut batches = scan(path, &self.config);
        if batches.open_error().is_some() {
            stats.source_unreadable = true;
            return Ok(self.finish(stats, out, start));
        }

        for batch in batches.by_ref() {
            let batch = batch?;
            self.run_batch(&batch, inner, &out, &mut stats)?;
        }

        stats.blocks_read = batches.stats().blocks_read;
        Ok(self.finish(stats, out, start))
    }

    /// The same batched join over an outer relation already in memory.
    pub fn join_rows(&self, outer: &[OuterRow], inner: &[InnerRow]) -> Result<JoinOutput> {
        let start = Instant::now();
        let mut stats = self.new_stats(inner);
        let out = ResultAggregator::new();
        if inner.is_empty() {
            return Ok(self.finish(stats, out, start));
        }
        for batch in outer.chunks(self.config.effective_batch_size()) {
            self.run_batch(batch, inner, &out, &mut stats)?;
        }
        Ok(self.finish(stats, out, start))
    }
}
