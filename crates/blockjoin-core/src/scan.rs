//! Sequential block reader that regroups decoded rows into logical batches.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::codec::{self, validate_capacity, CodecError};
use crate::config::JoinConfig;
use crate::error::{BlockJoinError, Result};
use crate::relation::{parse_outer, OuterRow};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub blocks_read: u64,
    pub records_decoded: u64,
    pub batches_yielded: u64,
}

/// Single-pass iterator of logical batches over a packed block stream.
///
/// A batch may span several blocks and a block may feed several batches.
/// After the first error the iterator is exhausted.
pub struct BlockScanner<R = BufReader<File>> {
    reader: R,
    source: PathBuf,
    block: Vec<u8>,
    batch_size: usize,
    current: Vec<OuterRow>,
    carry: std::vec::IntoIter<OuterRow>,
    stats: ScanStats,
    exhausted: bool,
}

impl BlockScanner<BufReader<File>> {
    pub fn open(path: &Path, config: &JoinConfig) -> Result<Self> {
        let file = File::open(path).map_err(|e| BlockJoinError::io(path, e))?;
        let mut scanner = Self::new(
            BufReader::new(file),
            config.block_capacity,
            config.effective_batch_size(),
        )?;
        scanner.source = path.to_path_buf();
        Ok(scanner)
    }
}

impl<R: Read> BlockScanner<R> {
    /// `batch_size` of zero is normalised to the default batch size.
    pub fn new(reader: R, block_capacity: usize, batch_size: usize) -> Result<Self> {
        validate_capacity(block_capacity)
            .map_err(|e| BlockJoinError::Configuration(e.to_string()))?;
        let batch_size = JoinConfig::default()
            .with_batch_size(batch_size)
            .effective_batch_size();
        Ok(Self {
            reader,
            source: PathBuf::from("<reader>"),
            block: vec![0; block_capacity],
            batch_size,
            current: Vec::with_capacity(batch_size),
            carry: Vec::new().into_iter(),
            stats: ScanStats::default(),
            exhausted: false,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Fills the block buffer; returns how many bytes were read.
    fn fill_block(&mut self) -> Result<usize> {
        let mut filled = 0;
        while filled < self.block.len() {
            match self.reader.read(&mut self.block[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(BlockJoinError::io(&self.source, e)),
            }
        }
        Ok(filled)
    }

    /// Reads and decodes the next block. `None` at end of stream.
    fn next_block_rows(&mut self) -> Result<Option<Vec<OuterRow>>> {
        let filled = self.fill_block()?;
        if filled == 0 {
            return Ok(None);
        }
        let block_idx = self.stats.blocks_read;
        // Every block is written at full capacity, so a short read means the
        // file length is not a multiple of the configured capacity.
        if filled < self.block.len() {
            return Err(BlockJoinError::CorruptBlock {
                block: block_idx,
                source: CodecError::Corrupt(format!(
                    "file ends {filled} bytes into a {}-byte block (block capacity mismatch?)",
                    self.block.len()
                )),
            });
        }

        self.stats.blocks_read += 1;
        let records = codec::decode_records(&self.block).map_err(|source| {
            BlockJoinError::CorruptBlock {
                block: block_idx,
                source,
            }
        })?;

        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            self.stats.records_decoded += 1;
            let ordinal = self.stats.records_decoded;
            if record.is_empty() {
                debug!(block = block_idx, record = ordinal, "skipping empty record");
                continue;
            }
            let text = std::str::from_utf8(record).map_err(|e| BlockJoinError::Parse {
                line: ordinal,
                reason: format!("record is not valid UTF-8: {e}"),
            })?;
            rows.push(parse_outer(ordinal, text)?);
        }
        debug!(block = block_idx, rows = rows.len(), "block decoded");
        Ok(Some(rows))
    }

    fn take_batch(&mut self) -> Vec<OuterRow> {
        self.stats.batches_yielded += 1;
        std::mem::replace(&mut self.current, Vec::with_capacity(self.batch_size))
    }
}

impl<R: Read> Iterator for BlockScanner<R> {
    type Item = Result<Vec<OuterRow>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            while self.current.len() < self.batch_size {
                match self.carry.next() {
                    Some(row) => self.current.push(row),
                    None => break,
                }
            }
            if self.current.len() == self.batch_size {
                return Some(Ok(self.take_batch()));
            }
            if self.exhausted {
                if self.current.is_empty() {
                    return None;
                }
                return Some(Ok(self.take_batch()));
            }
            match self.next_block_rows() {
                Ok(Some(rows)) => self.carry = rows.into_iter(),
                Ok(None) => self.exhausted = true,
                Err(e) => {
                    self.exhausted = true;
                    self.current.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Batches of a packed file, or nothing when the file cannot be opened.
pub struct Batches {
    scanner: Option<BlockScanner>,
    open_error: Option<BlockJoinError>,
}

impl Batches {
    /// The I/O failure that made this sequence empty, if any.
    pub fn open_error(&self) -> Option<&BlockJoinError> {
        self.open_error.as_ref()
    }

    pub fn stats(&self) -> ScanStats {
        self.scanner
            .as_ref()
            .map(BlockScanner::stats)
            .unwrap_or_default()
    }
}

impl Iterator for Batches {
    type Item = Result<Vec<OuterRow>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.scanner.as_mut()?.next()
    }
}

/// Opens `path` for scanning. An unreadable file is logged and yields no batches.
///
/// Configuration errors are reported the same way; call
/// [`JoinConfig::validate`] first to surface them separately.
pub fn scan(path: &Path, config: &JoinConfig) -> Batches {
    match BlockScanner::open(path, config) {
        Ok(scanner) => Batches {
            scanner: Some(scanner),
            open_error: None,
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open packed outer relation");
            Batches {
                scanner: None,
                open_error: Some(e),
            }
        }
    }
}
