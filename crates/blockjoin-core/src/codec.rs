//! Fixed-capacity block layout for the packed outer relation.
//!
//! ```text
//! [i32 record_count][i32 write_cursor][i32 len][len bytes]...[zero fill]
//! ```
//!
//! All integers are little-endian. Every block is exactly `capacity` bytes on
//! disk, and a record is never split across two blocks. Bytes past
//! `write_cursor` carry no meaning: this writer zero-fills them, readers
//! never look at them.

use thiserror::Error;

/// Block capacity shared by the packer and the scanner unless configured otherwise.
pub const DEFAULT_BLOCK_CAPACITY: usize = 8192;
/// `record_count` + `write_cursor`.
pub const BLOCK_HEADER_LEN: usize = 8;
/// Length prefix in front of every record.
pub const RECORD_PREFIX_LEN: usize = 4;
/// Smallest capacity that can hold one non-empty record.
pub const MIN_BLOCK_CAPACITY: usize = BLOCK_HEADER_LEN + RECORD_PREFIX_LEN + 1;
/// `write_cursor` is stored as an `i32`.
pub const MAX_BLOCK_CAPACITY: usize = i32::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("block capacity {0} outside [{min}, {max}]", min = MIN_BLOCK_CAPACITY, max = MAX_BLOCK_CAPACITY)]
    InvalidCapacity(usize),
    #[error("record of {len} bytes does not fit an empty block (max {max})")]
    RecordTooLarge { len: usize, max: usize },
    #[error("{0}")]
    Corrupt(String),
}

pub fn validate_capacity(capacity: usize) -> Result<(), CodecError> {
    if !(MIN_BLOCK_CAPACITY..=MAX_BLOCK_CAPACITY).contains(&capacity) {
        return Err(CodecError::InvalidCapacity(capacity));
    }
    Ok(())
}

/// Largest record payload a block of `capacity` bytes can hold.
pub fn max_record_len(capacity: usize) -> usize {
    capacity.saturating_sub(BLOCK_HEADER_LEN + RECORD_PREFIX_LEN)
}

fn read_i32(buf: &[u8], offset: usize) -> Result<i32, CodecError> {
    let bytes: [u8; 4] = offset
        .checked_add(4)
        .and_then(|end| buf.get(offset..end))
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| {
            CodecError::Corrupt(format!(
                "int32 at offset {offset} past end of {}-byte block",
                buf.len()
            ))
        })?;
    Ok(i32::from_le_bytes(bytes))
}

// ============================================================================
// Header
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub record_count: usize,
    pub write_cursor: usize,
}

impl BlockHeader {
    pub fn empty() -> Self {
        Self {
            record_count: 0,
            write_cursor: BLOCK_HEADER_LEN,
        }
    }

    /// Reads and validates the header against the block it sits in.
    pub fn read(block: &[u8]) -> Result<Self, CodecError> {
        if block.len() < BLOCK_HEADER_LEN {
            return Err(CodecError::Corrupt(format!(
                "block of {} bytes is shorter than its header",
                block.len()
            )));
        }
        let record_count = read_i32(block, 0)?;
        let write_cursor = read_i32(block, 4)?;
        if record_count < 0 {
            return Err(CodecError::Corrupt(format!(
                "negative record count {record_count}"
            )));
        }
        if write_cursor < BLOCK_HEADER_LEN as i32 || write_cursor as usize > block.len() {
            return Err(CodecError::Corrupt(format!(
                "write cursor {write_cursor} outside [{BLOCK_HEADER_LEN}, {}]",
                block.len()
            )));
        }
        let header = Self {
            record_count: record_count as usize,
            write_cursor: write_cursor as usize,
        };
        let body = header.write_cursor - BLOCK_HEADER_LEN;
        if header.record_count > body / RECORD_PREFIX_LEN {
            return Err(CodecError::Corrupt(format!(
                "header claims {} records but only {body} bytes are written",
                header.record_count
            )));
        }
        Ok(header)
    }

    /// Writes the header into the first [`BLOCK_HEADER_LEN`] bytes of `buf`.
    pub fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&(self.record_count as i32).to_le_bytes());
        buf[4..8].copy_from_slice(&(self.write_cursor as i32).to_le_bytes());
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Accumulates length-prefixed records into one fixed-capacity block.
#[derive(Debug)]
pub struct BlockBuilder {
    buf: Vec<u8>,
    header: BlockHeader,
}

impl BlockBuilder {
    pub fn new(capacity: usize) -> Result<Self, CodecError> {
        validate_capacity(capacity)?;
        Ok(Self {
            buf: vec![0; capacity],
            header: BlockHeader::empty(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn record_count(&self) -> usize {
        self.header.record_count
    }

    pub fn write_cursor(&self) -> usize {
        self.header.write_cursor
    }

    pub fn is_empty(&self) -> bool {
        self.header.record_count == 0
    }

    pub fn max_record_len(&self) -> usize {
        max_record_len(self.capacity())
    }

    /// Whether a record of `len` bytes fits the space left in this block.
    pub fn fits(&self, len: usize) -> bool {
        self.header.write_cursor + RECORD_PREFIX_LEN + len <= self.capacity()
    }

    /// Appends `record` if it fits; leaves the block untouched otherwise.
    pub fn try_push(&mut self, record: &[u8]) -> bool {
        if !self.fits(record.len()) {
            return false;
        }
        let at = self.header.write_cursor;
        self.buf[at..at + RECORD_PREFIX_LEN].copy_from_slice(&(record.len() as i32).to_le_bytes());
        let data_at = at + RECORD_PREFIX_LEN;
        self.buf[data_at..data_at + record.len()].copy_from_slice(record);
        self.header.write_cursor = data_at + record.len();
        self.header.record_count += 1;
        true
    }

    /// Discards any pending records.
    pub fn reset(&mut self) {
        let used = self.header.write_cursor;
        self.buf[..used].fill(0);
        self.header = BlockHeader::empty();
    }

    /// Finalizes the block at full capacity and starts a fresh empty one.
    pub fn finish(&mut self) -> Vec<u8> {
        let capacity = self.capacity();
        let mut block = std::mem::replace(&mut self.buf, vec![0; capacity]);
        self.header.write(&mut block);
        self.header = BlockHeader::empty();
        block
    }
}

/// Packs `rows` into as many full-capacity blocks as needed.
///
/// The last block is always emitted, so an empty input yields one empty block.
pub fn encode<I>(rows: I, capacity: usize) -> Result<Vec<Vec<u8>>, CodecError>
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let mut builder = BlockBuilder::new(capacity)?;
    let mut blocks = Vec::new();
    for row in rows {
        let row = row.as_ref();
        if builder.try_push(row) {
            continue;
        }
        if builder.is_empty() {
            return Err(CodecError::RecordTooLarge {
                len: row.len(),
                max: builder.max_record_len(),
            });
        }
        blocks.push(builder.finish());
        if !builder.try_push(row) {
            return Err(CodecError::RecordTooLarge {
                len: row.len(),
                max: builder.max_record_len(),
            });
        }
    }
    blocks.push(builder.finish());
    Ok(blocks)
}

// ============================================================================
// Decoding
// ============================================================================

/// Returns the raw record slices of `block`, in write order.
pub fn decode_records(block: &[u8]) -> Result<Vec<&[u8]>, CodecError> {
    let header = BlockHeader::read(block)?;
    let end = header.write_cursor;
    let mut records = Vec::with_capacity(header.record_count);
    let mut offset = BLOCK_HEADER_LEN;

    for idx in 0..header.record_count {
        if offset + RECORD_PREFIX_LEN > end {
            return Err(CodecError::Corrupt(format!(
                "record {idx}: length prefix at offset {offset} past write cursor {end}"
            )));
        }
        let len = read_i32(block, offset)?;
        if len < 0 {
            return Err(CodecError::Corrupt(format!(
                "record {idx}: negative length {len}"
            )));
        }
        offset += RECORD_PREFIX_LEN;
        let len = len as usize;
        if len > end - offset {
            return Err(CodecError::Corrupt(format!(
                "record {idx}: {len} bytes at offset {offset} overrun write cursor {end}"
            )));
        }
        records.push(&block[offset..offset + len]);
        offset += len;
    }

    if offset != end {
        return Err(CodecError::Corrupt(format!(
            "records end at offset {offset} but write cursor is {end}"
        )));
    }
    Ok(records)
}

pub fn decode(block: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
    Ok(decode_records(block)?
        .into_iter()
        .map(<[u8]>::to_vec)
        .collect())
}
