//! Block nested loop join between a disk-resident outer relation, streamed
//! from a packed fixed-size-block file, and an in-memory inner relation.
//!
//! ```no_run
//! use blockjoin_core::{load_inner, JoinConfig, JoinEngine};
//! use std::path::Path;
//!
//! # fn main() -> blockjoin_core::Result<()> {
//! let orders = load_inner(Path::new("data/orders.tbl"), None)?;
//! let engine = JoinEngine::new(JoinConfig::default().with_batch_size(1000))?;
//! let output = engine.join_file(Path::new("data/customer.dat"), &orders)?;
//! println!("{} joined rows", output.rows.len());
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod codec;
pub mod config;
pub mod error;
pub mod join;
pub mod pack;
pub mod relation;
pub mod scan;

pub use aggregate::ResultAggregator;
pub use codec::{
    decode, decode_records, encode, BlockBuilder, BlockHeader, CodecError, BLOCK_HEADER_LEN,
    DEFAULT_BLOCK_CAPACITY, RECORD_PREFIX_LEN,
};
pub use config::{JoinConfig, JoinStrategy, DEFAULT_BATCH_SIZE, DEFAULT_WORKERS};
pub use error::{BlockJoinError, Result};
pub use join::{
    nested_loop_join, partition_ranges, BatchReport, JoinEngine, JoinOutput, JoinStats,
};
pub use pack::{pack_table, BlockFileWriter, PackStats};
pub use relation::{
    load_inner, load_outer, parse_inner, parse_outer, write_joined, InnerRow, JoinedRow,
    OuterRow,
};
pub use scan::{scan, Batches, BlockScanner, ScanStats};
