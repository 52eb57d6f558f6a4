use std::collections::HashMap;
use std::path::Path;

use calamine::{open_workbook_auto, Reader};
use log::warn;

use crate::error::BatchError;
use crate::record::{RawRow, REQUIRED_COLUMNS};
use crate::validate::InputKind;

/// Parsed table: ordered header names plus one `RawRow` per data row.
#[derive(Debug)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl Table {
    /// Fails with `MissingColumns` unless every required header is present,
    /// exact and case-sensitive.
    pub fn require_columns(&self) -> Result<(), BatchError> {
        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .filter(|c| !self.headers.iter().any(|h| h == *c))
            .map(|c| c.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(BatchError::MissingColumns(missing))
        }
    }
}

/// Reads the whole table from an already-validated input file.
pub fn read_table(path: &Path, kind: InputKind) -> Result<Table, BatchError> {
    match kind {
        InputKind::Spreadsheet => read_spreadsheet(path),
        InputKind::Csv => read_csv(path),
    }
}

fn read_spreadsheet(path: &Path) -> Result<Table, BatchError> {
    let mut workbook = open_workbook_auto(path)?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| BatchError::MalformedSpreadsheet(path.to_path_buf()))?;
    let range = workbook.worksheet_range(&sheet)?;

    let mut source_rows = range.rows();
    let headers: Vec<String> = match source_rows.next() {
        Some(header_row) => header_row.iter().map(|cell| cell.to_string()).collect(),
        None => Vec::new(),
    };

    let rows = source_rows
        .enumerate()
        .map(|(index, row)| {
            let mut cells = HashMap::new();
            for (i, cell) in row.iter().enumerate() {
                if i < headers.len() {
                    cells.insert(headers[i].clone(), cell.to_string());
                }
            }
            RawRow { index, cells }
        })
        .collect();

    Ok(Table { headers, rows })
}

fn read_csv(path: &Path) -> Result<Table, BatchError> {
    let bytes = std::fs::read(path)?;
    let mut text = decode_text(&bytes);
    if text.starts_with('\u{feff}') {
        text.remove(0);
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();

    let mut rows = Vec::new();
    for (index, result) in reader.records().enumerate() {
        let row = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping unreadable row {}: {}", index + 1, e);
                continue;
            }
        };
        let mut cells = HashMap::new();
        for (i, cell) in row.iter().enumerate() {
            if i < headers.len() {
                cells.insert(headers[i].clone(), cell.to_string());
            }
        }
        rows.push(RawRow { index, cells });
    }

    Ok(Table { headers, rows })
}

/// UTF-8 first, then Latin-1, which maps every byte onto the code point of
/// the same value.
fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{COL_FAMILY_CARD, COL_IDENTITY, COL_NAME, COL_PAYLOAD};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn csv_rows_become_header_keyed_maps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("in.csv");
        fs::write(
            &path,
            "NO IDENTITAS,NOMOR KK,NAMA LENGKAP,KODE QR\n111,222,\"Budi, Jr\",payload\n",
        )
        .unwrap();

        let table = read_table(&path, InputKind::Csv).unwrap();
        table.require_columns().unwrap();
        assert_eq!(table.rows.len(), 1);
        let row = &table.rows[0];
        assert_eq!(row.index, 0);
        assert_eq!(row.get(COL_IDENTITY), Some("111"));
        assert_eq!(row.get(COL_NAME), Some("Budi, Jr"));
        assert_eq!(row.get("KECAMATAN"), None);
    }

    #[test]
    fn missing_required_columns_are_reported_up_front() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("in.csv");
        fs::write(&path, "NO IDENTITAS,NAMA LENGKAP\n111,Budi\n").unwrap();

        let table = read_table(&path, InputKind::Csv).unwrap();
        let err = table.require_columns().unwrap_err();
        match err {
            BatchError::MissingColumns(missing) => {
                assert_eq!(missing, vec![COL_FAMILY_CARD.to_string(), COL_PAYLOAD.to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn byte_order_mark_does_not_break_the_first_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bom.csv");
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(b"NO IDENTITAS,NOMOR KK,NAMA LENGKAP,KODE QR\n1,2,3,4\n");
        fs::write(&path, bytes).unwrap();

        let table = read_table(&path, InputKind::Csv).unwrap();
        assert_eq!(table.headers[0], COL_IDENTITY);
        table.require_columns().unwrap();
    }

    #[test]
    fn latin1_bytes_fall_back_to_single_byte_decoding() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("latin.csv");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"NO IDENTITAS,NOMOR KK,NAMA LENGKAP,KODE QR\n1,2,Ren");
        bytes.push(0xE9); // 'é' in Latin-1, invalid on its own in UTF-8
        bytes.extend_from_slice(b",4\n");
        fs::write(&path, bytes).unwrap();

        let table = read_table(&path, InputKind::Csv).unwrap();
        assert_eq!(table.rows[0].get(COL_NAME), Some("René"));
    }

    #[test]
    fn short_csv_rows_leave_trailing_columns_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.csv");
        fs::write(
            &path,
            "NO IDENTITAS,NOMOR KK,NAMA LENGKAP,KODE QR,KECAMATAN\n1,2,3,4\n",
        )
        .unwrap();

        let table = read_table(&path, InputKind::Csv).unwrap();
        let row = &table.rows[0];
        assert_eq!(row.get(COL_PAYLOAD), Some("4"));
        assert_eq!(row.get("KECAMATAN"), None);
    }
}
