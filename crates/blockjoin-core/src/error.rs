use std::path::PathBuf;

use thiserror::Error;

use crate::codec::CodecError;

pub type Result<T> = std::result::Result<T, BlockJoinError>;

#[derive(Debug, Error)]
pub enum BlockJoinError {
    #[error("io: {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt block {block}: {source}")]
    CorruptBlock {
        block: u64,
        #[source]
        source: CodecError,
    },
    #[error("parse error at line {line}: {reason}")]
    Parse { line: u64, reason: String },
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("worker {worker} failed: {reason}")]
    Worker { worker: usize, reason: String },
}

impl BlockJoinError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BlockJoinError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for failures the scanner boundary recovers from (unreadable source).
    pub fn is_io(&self) -> bool {
        matches!(self, BlockJoinError::Io { .. })
    }
}
