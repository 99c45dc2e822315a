//! Row types and `|`-delimited table I/O.
//!
//! Outer rows take the key from column 0 and the payload from column 1.
//! Inner rows take an id from column 0, the join key from column 1 and the
//! payload from column 8 (the TPC-H `orders.o_comment` position) when present.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use rayon::prelude::*;
use tracing::info;

use crate::error::{BlockJoinError, Result};

pub const FIELD_DELIMITER: char = '|';
const INNER_PAYLOAD_COLUMN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OuterRow {
    pub key: i64,
    pub payload: String,
}

impl OuterRow {
    pub fn new(key: i64, payload: impl Into<String>) -> Self {
        Self {
            key,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InnerRow {
    pub id: i64,
    pub key: i64,
    pub payload: String,
}

impl InnerRow {
    pub fn new(id: i64, key: i64, payload: impl Into<String>) -> Self {
        Self {
            id,
            key,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JoinedRow {
    pub outer_key: i64,
    pub outer_payload: String,
    pub inner_id: i64,
    pub inner_payload: String,
}

impl JoinedRow {
    pub fn new(outer: &OuterRow, inner: &InnerRow) -> Self {
        Self {
            outer_key: outer.key,
            outer_payload: outer.payload.clone(),
            inner_id: inner.id,
            inner_payload: inner.payload.clone(),
        }
    }
}

impl fmt::Display for JoinedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.outer_key, self.outer_payload, self.inner_id, self.inner_payload
        )
    }
}

fn parse_key(line: u64, column: usize, field: &str) -> Result<i64> {
    field.trim().parse().map_err(|e| BlockJoinError::Parse {
        line,
        reason: format!("column {column} '{field}' is not an integer key: {e}"),
    })
}

fn too_few_columns(line: u64, found: usize) -> BlockJoinError {
    BlockJoinError::Parse {
        line,
        reason: format!("expected at least 2 columns, found {found}"),
    }
}

pub fn parse_outer(line: u64, text: &str) -> Result<OuterRow> {
    let mut fields = text.split(FIELD_DELIMITER);
    match (fields.next(), fields.next()) {
        (Some(key), Some(payload)) => Ok(OuterRow {
            key: parse_key(line, 0, key)?,
            payload: payload.to_string(),
        }),
        (first, _) => Err(too_few_columns(line, first.map_or(0, |_| 1))),
    }
}

pub fn parse_inner(line: u64, text: &str) -> Result<InnerRow> {
    let fields: Vec<&str> = text.split(FIELD_DELIMITER).collect();
    if fields.len() < 2 {
        return Err(too_few_columns(line, fields.len()));
    }
    Ok(InnerRow {
        id: parse_key(line, 0, fields[0])?,
        key: parse_key(line, 1, fields[1])?,
        payload: fields
            .get(INNER_PAYLOAD_COLUMN)
            .map(|s| s.to_string())
            .unwrap_or_default(),
    })
}

fn load_table<T, F>(path: &Path, max_rows: Option<usize>, parse: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(u64, &str) -> Result<T> + Sync,
{
    let text = fs::read_to_string(path).map_err(|e| BlockJoinError::io(path, e))?;
    let lines: Vec<(u64, &str)> = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.is_empty())
        .take(max_rows.unwrap_or(usize::MAX))
        .map(|(idx, line)| (idx as u64 + 1, line))
        .collect();

    let rows: Vec<T> = lines
        .par_iter()
        .map(|&(line, text)| parse(line, text))
        .collect::<Result<_>>()?;
    info!(path = %path.display(), rows = rows.len(), "table loaded");
    Ok(rows)
}

/// Loads an outer relation from a `.tbl` file, keeping at most `max_rows` rows.
pub fn load_outer(path: &Path, max_rows: Option<usize>) -> Result<Vec<OuterRow>> {
    load_table(path, max_rows, parse_outer)
}

/// Loads the inner relation fully into memory.
pub fn load_inner(path: &Path, max_rows: Option<usize>) -> Result<Vec<InnerRow>> {
    load_table(path, max_rows, parse_inner)
}

/// Writes one `outer_key|outer_payload|inner_id|inner_payload` line per row.
pub fn write_joined(path: &Path, rows: &[JoinedRow]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| BlockJoinError::io(parent, e))?;
    }
    let file = File::create(path).map_err(|e| BlockJoinError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    for row in rows {
        writeln!(writer, "{row}").map_err(|e| BlockJoinError::io(path, e))?;
    }
    writer.flush().map_err(|e| BlockJoinError::io(path, e))?;
    info!(path = %path.display(), rows = rows.len(), "joined rows written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_tpch_customer_line() {
        let row = parse_outer(1, "1|Customer#000000001|IVhzIApeRb ot,c,E|15|25-989-741-2988|711.56|BUILDING|regular|").unwrap();
        assert_eq!(row, OuterRow::new(1, "Customer#000000001"));
    }

    #[test]
    fn parses_tpch_order_line() {
        let row = parse_inner(
            3,
            "1|36901|O|173665.47|1996-01-02|5-LOW|Clerk#000000951|0|nstructions sleep furiously among |",
        )
        .unwrap();
        assert_eq!(row, InnerRow::new(1, 36901, "nstructions sleep furiously among "));
    }

    #[test]
    fn short_inner_line_has_empty_payload() {
        assert_eq!(parse_inner(1, "100|1").unwrap(), InnerRow::new(100, 1, ""));
    }

    #[test]
    fn malformed_lines_are_parse_errors() {
        assert!(matches!(parse_outer(4, "no-delimiter"), Err(BlockJoinError::Parse { line: 4, .. })));
        assert!(matches!(parse_outer(5, "abc|Bob"), Err(BlockJoinError::Parse { line: 5, .. })));
        assert!(matches!(parse_inner(6, "1|x|O"), Err(BlockJoinError::Parse { line: 6, .. })));
    }

    #[test]
    fn load_skips_blank_lines_and_caps_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("customer.tbl");
        fs::write(&path, "1|Alice|\n\n2|Bob|\n3|Carol|\n").unwrap();

        let all = load_outer(&path, None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2], OuterRow::new(3, "Carol"));

        let capped = load_outer(&path, Some(2)).unwrap();
        assert_eq!(capped, vec![OuterRow::new(1, "Alice"), OuterRow::new(2, "Bob")]);
    }

    #[test]
    fn load_reports_line_of_bad_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("orders.tbl");
        fs::write(&path, "100|1|rush\n\nbad|row\n").unwrap();
        assert!(matches!(load_inner(&path, None), Err(BlockJoinError::Parse { line: 3, .. })));
    }

    #[test]
    fn missing_table_is_io_error() {
        let dir = tempdir().unwrap();
        let err = load_inner(&dir.path().join("nope.tbl"), None).unwrap_err();
        assert!(err.is_io());
    }

    #[test]
    fn writes_joined_rows_creating_parent_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("output/result.tbl");
        let rows = vec![JoinedRow {
            outer_key: 1,
            outer_payload: "Alice".into(),
            inner_id: 100,
            inner_payload: "rush".into(),
        }];
        write_joined(&path, &rows).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1|Alice|100|rush\n");
    }
}
