use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::codec::{self, DEFAULT_BLOCK_CAPACITY};
use crate::error::{BlockJoinError, Result};

/// Outer rows per logical batch when none (or zero) is configured.
pub const DEFAULT_BATCH_SIZE: usize = 1000;
/// Worker count used when the platform cannot report its parallelism.
pub const DEFAULT_WORKERS: usize = 4;

/// How one logical batch is joined against the inner relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinStrategy {
    Serial,
    Parallel,
}

impl fmt::Display for JoinStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinStrategy::Serial => write!(f, "serial"),
            JoinStrategy::Parallel => write!(f, "parallel"),
        }
    }
}

impl FromStr for JoinStrategy {
    type Err = BlockJoinError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "serial" => Ok(JoinStrategy::Serial),
            "parallel" => Ok(JoinStrategy::Parallel),
            other => Err(BlockJoinError::Configuration(format!(
                "unknown join strategy '{other}' (expected serial or parallel)"
            ))),
        }
    }
}

/// Settings shared by the packer, the scanner and the join engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    /// Bytes per on-disk block. The packer and the scanner must agree on it.
    pub block_capacity: usize,
    /// Outer rows per logical batch (0 means [`DEFAULT_BATCH_SIZE`]).
    pub batch_size: usize,
    pub strategy: JoinStrategy,
    /// Fixed worker count for the parallel strategy; `None` asks the runtime.
    pub workers: Option<usize>,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            block_capacity: DEFAULT_BLOCK_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            strategy: JoinStrategy::Parallel,
            workers: None,
        }
    }
}

impl JoinConfig {
    pub fn with_block_capacity(mut self, capacity: usize) -> Self {
        self.block_capacity = capacity;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_strategy(mut self, strategy: JoinStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_workers(mut self, workers: Option<usize>) -> Self {
        self.workers = workers;
        self
    }

    /// Reads a JSON config file; missing fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| BlockJoinError::io(path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            BlockJoinError::Configuration(format!("{}: {e}", path.display()))
        })
    }

    pub fn validate(&self) -> Result<()> {
        codec::validate_capacity(self.block_capacity)
            .map_err(|e| BlockJoinError::Configuration(e.to_string()))?;
        if self.workers == Some(0) {
            return Err(BlockJoinError::Configuration(
                "workers must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn effective_batch_size(&self) -> usize {
        if self.batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            self.batch_size
        }
    }

    /// Configured worker count, else available parallelism, else [`DEFAULT_WORKERS`].
    pub fn resolved_workers(&self) -> usize {
        match self.workers {
            Some(n) => n.max(1),
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(DEFAULT_WORKERS),
        }
    }
}
