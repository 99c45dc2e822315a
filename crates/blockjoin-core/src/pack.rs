use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::codec::{BlockBuilder, CodecError};
use crate::config::JoinConfig;
use crate::error::{BlockJoinError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PackStats {
    pub records: u64,
    pub blocks: u64,
    pub bytes: u64,
}

/// Streams records into full-capacity blocks on `W`.
pub struct BlockFileWriter<W: Write> {
    writer: W,
    sink: PathBuf,
    builder: BlockBuilder,
    stats: PackStats,
}

impl<W: Write> BlockFileWriter<W> {
    pub fn new(writer: W, block_capacity: usize) -> Result<Self> {
        Ok(Self {
            writer,
            sink: PathBuf::from("<writer>"),
            builder: BlockBuilder::new(block_capacity)?,
            stats: PackStats::default(),
        })
    }

    fn with_sink(mut self, sink: &Path) -> Self {
        self.sink = sink.to_path_buf();
        self
    }

    fn write_block(&mut self) -> Result<()> {
        let block = self.builder.finish();
        self.writer
            .write_all(&block)
            .map_err(|e| BlockJoinError::io(&self.sink, e))?;
        self.stats.blocks += 1;
        self.stats.bytes += block.len() as u64;
        Ok(())
    }

    pub fn write_record(&mut self, record: &[u8]) -> Result<()> {
        if !self.builder.try_push(record) {
            let too_large = CodecError::RecordTooLarge {
                len: record.len(),
                max: self.builder.max_record_len(),
            };
            if self.builder.is_empty() {
                return Err(too_large.into());
            }
            self.write_block()?;
            if !self.builder.try_push(record) {
                return Err(too_large.into());
            }
        }
        self.stats.records += 1;
        Ok(())
    }

    /// Writes the final (possibly partial or empty) block and flushes.
    pub fn finish(mut self) -> Result<(W, PackStats)> {
        self.write_block()?;
        self.writer
            .flush()
            .map_err(|e| BlockJoinError::io(&self.sink, e))?;
        Ok((self.writer, self.stats))
    }
}

/// Converts a `|`-delimited table into the packed block format, one record
/// per non-empty line, using `config.block_capacity`.
pub fn pack_table(tbl_path: &Path, dat_path: &Path, config: &JoinConfig) -> Result<PackStats> {
    config.validate()?;
    let input = File::open(tbl_path).map_err(|e| BlockJoinError::io(tbl_path, e))?;
    if let Some(parent) = dat_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| BlockJoinError::io(parent, e))?;
    }
    let output = File::create(dat_path).map_err(|e| BlockJoinError::io(dat_path, e))?;

    let mut writer =
        BlockFileWriter::new(BufWriter::new(output), config.block_capacity)?.with_sink(dat_path);
    for line in BufReader::new(input).lines() {
        let line = line.map_err(|e| BlockJoinError::io(tbl_path, e))?;
        if line.is_empty() {
            continue;
        }
        writer.write_record(line.as_bytes())?;
    }
    let (_, stats) = writer.finish()?;

    info!(
        input = %tbl_path.display(),
        output = %dat_path.display(),
        records = stats.records,
        blocks = stats.blocks,
        block_capacity = config.block_capacity,
        "table packed"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};
    use tempfile::tempdir;

    #[test]
    fn writer_matches_batch_encoder() {
        let rows: Vec<String> = (0..50).map(|i| format!("{i}|name-{i}|")).collect();
        let mut writer = BlockFileWriter::new(Vec::new(), 96).unwrap();
        for row in &rows {
            writer.write_record(row.as_bytes()).unwrap();
        }
        let (bytes, stats) = writer.finish().unwrap();

        let expected = encode(&rows, 96).unwrap();
        assert_eq!(stats.blocks, expected.len() as u64);
        assert_eq!(stats.records, 50);
        assert_eq!(stats.bytes, bytes.len() as u64);
        assert_eq!(bytes, expected.concat());
    }

    #[test]
    fn oversized_line_is_rejected() {
        let mut writer = BlockFileWriter::new(Vec::new(), 32).unwrap();
        writer.write_record(b"short").unwrap();
        let err = writer.write_record(&[b'x'; 64]).unwrap_err();
        assert!(matches!(
            err,
            BlockJoinError::Codec(CodecError::RecordTooLarge { len: 64, max: 20 })
        ));
    }

    #[test]
    fn pack_table_skips_blank_lines() {
        let dir = tempdir().unwrap();
        let tbl = dir.path().join("customer.tbl");
        let dat = dir.path().join("packed/customer.dat");
        fs::write(&tbl, "1|Alice|\n\n2|Bob|\n").unwrap();

        let config = JoinConfig::default().with_block_capacity(64);
        let stats = pack_table(&tbl, &dat, &config).unwrap();
        assert_eq!(stats, PackStats { records: 2, blocks: 1, bytes: 64 });

        let bytes = fs::read(&dat).unwrap();
        assert_eq!(bytes.len(), 64);
        assert_eq!(decode(&bytes).unwrap(), vec![b"1|Alice|".to_vec(), b"2|Bob|".to_vec()]);
    }

    #[test]
    fn empty_table_packs_one_empty_block() {
        let dir = tempdir().unwrap();
        let tbl = dir.path().join("empty.tbl");
        let dat = dir.path().join("empty.dat");
        fs::write(&tbl, "").unwrap();

        let stats = pack_table(&tbl, &dat, &JoinConfig::default()).unwrap();
        assert_eq!(stats.blocks, 1);
        assert_eq!(fs::metadata(&dat).unwrap().len(), 8192);
    }

    #[test]
    fn missing_input_is_io_error() {
        let dir = tempdir().unwrap();
        let err = pack_table(
            &dir.path().join("missing.tbl"),
            &dir.path().join("out.dat"),
            &JoinConfig::default(),
        )
        .unwrap_err();
        assert!(err.is_io());
    }
}
