use std::fs;
use std::path::Path;

use anyhow::Context;
use calamine::{open_workbook_auto, Data, Reader};
use encoding_rs::{UTF_16BE, UTF_16LE, WINDOWS_1251};
use rust_xlsxwriter::{Format, Workbook};
use tracing::debug;

use crate::error::PipelineError;
use crate::models::{Cell, Table};

const DELIMITERS: [u8; 3] = [b';', b',', b'\t'];

/// Reads the first sheet of an Excel/ODS workbook or a CSV file.
pub fn read_table(path: &Path) -> anyhow::Result<Table> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .unwrap_or_default();

    let table = match extension.as_str() {
        "xlsx" | "xlsm" | "xls" | "ods" => read_workbook(path)?,
        "csv" => read_csv(path)?,
        _ => return Err(PipelineError::UnsupportedFormat(extension).into()),
    };
    debug!(
        path = %path.display(),
        rows = table.len(),
        columns = table.columns.len(),
        "read table"
    );
    Ok(table)
}

fn read_workbook(path: &Path) -> anyhow::Result<Table> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("failed to open workbook {}", path.display()))?;
    let range = workbook
        .worksheet_range_at(0)
        .with_context(|| format!("workbook {} has no sheets", path.display()))?
        .with_context(|| format!("failed to read first sheet of {}", path.display()))?;

    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Ok(Table::default());
    };
    let mut table = Table::new(header_names(header.iter().map(data_to_cell)));
    for row in rows {
        let cells: Vec<Cell> = row.iter().map(data_to_cell).collect();
        if cells.iter().any(|c| !c.is_empty()) {
            table.push_row(cells);
        }
    }
    Ok(table)
}

fn data_to_cell(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        Data::String(s) if s.trim().is_empty() => Cell::Empty,
        Data::String(s) => Cell::Text(s.clone()),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Float(f) => Cell::Number(*f),
        Data::Error(_) => Cell::Empty,
        Data::DateTime(excel_dt) => excel_timestamp(excel_dt.as_f64())
            .map(Cell::Text)
            .unwrap_or_else(|| Cell::Number(excel_dt.as_f64())),
        other => Cell::Text(other.to_string()),
    }
}

/// Formats an Excel serial date the way text exports print timestamps.
fn excel_timestamp(serial: f64) -> Option<String> {
    let secs = ((serial - 25569.0) * 86400.0).round();
    if !secs.is_finite() {
        return None;
    }
    chrono::DateTime::from_timestamp(secs as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// Blank headers get positional names so every column stays addressable.
fn header_names(cells: impl Iterator<Item = Cell>) -> Vec<String> {
    cells
        .enumerate()
        .map(|(idx, cell)| match cell.as_text() {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => format!("Unnamed: {idx}"),
        })
        .collect()
}

fn decode(bytes: &[u8]) -> (String, Option<u8>) {
    if let Some((encoding, bom)) = encoding_rs::Encoding::for_bom(bytes) {
        let (text, _) = encoding.decode_without_bom_handling(&bytes[bom..]);
        let delimiter = (encoding == UTF_16LE || encoding == UTF_16BE).then_some(b'\t');
        return (text.into_owned(), delimiter);
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), None),
        Err(_) => {
            let (text, _, _) = WINDOWS_1251.decode(bytes);
            (text.into_owned(), None)
        }
    }
}

fn sniff_delimiter(text: &str) -> u8 {
    let header = text.lines().next().unwrap_or_default();
    DELIMITERS
        .iter()
        .copied()
        .max_by_key(|d| header.bytes().filter(|b| b == d).count())
        .filter(|d| header.as_bytes().contains(d))
        .unwrap_or(b',')
}

fn read_csv(path: &Path) -> anyhow::Result<Table> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let (text, forced) = decode(&bytes);
    let delimiter = forced.unwrap_or_else(|| sniff_delimiter(&text));

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .with_context(|| format!("failed to read CSV header of {}", path.display()))?
        .clone();
    let mut table = Table::new(header_names(headers.iter().map(Cell::text)));

    for record in reader.records() {
        let record = record.context("failed to parse CSV row")?;
        let cells: Vec<Cell> = record
            .iter()
            .map(|value| {
                if value.trim().is_empty() {
                    Cell::Empty
                } else {
                    Cell::text(value)
                }
            })
            .collect();
        if cells.iter().any(|c| !c.is_empty()) {
            table.push_row(cells);
        }
    }
    Ok(table)
}

/// Writes `table` as a single-sheet xlsx file with a bold header row.
pub fn write_table(table: &Table, path: &Path, sheet_name: &str) -> anyhow::Result<()> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name(sheet_name)?;

    let bold = Format::new().set_bold();
    for (col, name) in table.columns.iter().enumerate() {
        if name.is_empty() {
            continue;
        }
        sheet.write_string_with_format(0, col as u16, name, &bold)?;
    }
    for (idx, row) in table.rows.iter().enumerate() {
        let r = (idx + 1) as u32;
        for (col, cell) in row.iter().enumerate() {
            match cell {
                Cell::Empty => {}
                Cell::Number(n) if n.is_finite() => {
                    sheet.write_number(r, col as u16, *n)?;
                }
                Cell::Number(_) => {}
                Cell::Text(s) => {
                    sheet.write_string(r, col as u16, s)?;
                }
            }
        }
    }

    workbook
        .save(path)
        .with_context(|| format!("failed to save Excel file: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xlsx_round_trip_keeps_cells_and_names_blank_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grades.xlsx");
        let mut table = Table::new(["Адрес электронной почты", "", "Оценка"]);
        table.push_row(vec![Cell::text("a@edu.hse.ru"), Cell::Empty, Cell::Number(7.0)]);
        table.push_row(vec![Cell::text("b@edu.hse.ru"), Cell::text("x"), Cell::text("8,5")]);

        write_table(&table, &path, "Результат").unwrap();
        let read = read_table(&path).unwrap();

        assert_eq!(read.columns, vec!["Адрес электронной почты", "Unnamed: 1", "Оценка"]);
        assert_eq!(read.len(), 2);
        assert_eq!(read.cell(0, 2), &Cell::Number(7.0));
        assert_eq!(read.cell(0, 1), &Cell::Empty);
        assert_eq!(read.cell(1, 2), &Cell::text("8,5"));
    }

    #[test]
    fn windows_1251_csv_is_decoded_and_delimiter_sniffed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.csv");
        let (bytes, _, _) = WINDOWS_1251.encode("ФИО;Корпоративная почта\nИванов Иван;ivan@edu.hse.ru\n;\n");
        fs::write(&path, bytes.as_ref()).unwrap();

        let table = read_table(&path).unwrap();
        assert_eq!(table.columns, vec!["ФИО", "Корпоративная почта"]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.cell(0, 0), &Cell::text("Иванов Иван"));
    }

    #[test]
    fn utf16_csv_is_tab_separated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("course.csv");
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "Email\tСтатус\na@edu.hse.ru\tВыполнено\n".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        fs::write(&path, bytes).unwrap();

        let table = read_table(&path).unwrap();
        assert_eq!(table.columns, vec!["Email", "Статус"]);
        assert_eq!(table.cell(0, 1), &Cell::text("Выполнено"));
    }

    #[test]
    fn excel_serial_dates_become_timestamps() {
        assert_eq!(
            excel_timestamp(45566.5).as_deref(),
            Some("2024-10-01 12:00:00")
        );
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = read_table(Path::new("grades.pdf")).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PipelineError>(),
            Some(&PipelineError::UnsupportedFormat("pdf".to_string()))
        );
    }
}
