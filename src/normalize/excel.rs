#![cfg(feature = "excel")]

//! Spreadsheet-to-CSV conversion (`.xlsx`, `.xls`, `.xlsm`, `.xlsb`, `.ods`).

use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use chrono::Timelike;
use tracing::debug;

use crate::error::NormalizeFailure;
use crate::types::{NormalizerResult, SourceFile};

use super::{canonical_header, converted_result, write_canonical, Normalizer, Scratch, SheetSelection};

/// One sheet rendered as text cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetTable {
    /// Name of the sheet that was read.
    pub sheet: String,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Convert one sheet of a workbook into canonical CSV inside `scratch`.
///
/// Behavior:
/// - Picks the sheet per `selection`; [`SheetSelection::First`] is the first sheet in workbook
///   order, so the choice is stable across runs
/// - Detects the first non-empty row as the header row
/// - Drops fully blank rows and renders every cell as displayed text
pub fn convert_workbook(
    source: &SourceFile,
    selection: &SheetSelection,
    scratch: &mut Scratch,
) -> Result<NormalizerResult, NormalizeFailure> {
    let table = read_sheet(source.path(), selection)?;
    let out = scratch.create(&source.stem(), "csv")?;
    write_canonical(&out, &table.header, &table.rows)?;

    debug!(
        path = %source.path().display(),
        sheet = %table.sheet,
        columns = table.header.len(),
        rows = table.rows.len(),
        "converted spreadsheet"
    );

    converted_result(Normalizer::Spreadsheet, &out)
}

/// Read the selected sheet of the workbook at `path`.
pub fn read_sheet(
    path: impl AsRef<Path>,
    selection: &SheetSelection,
) -> Result<SheetTable, NormalizeFailure> {
    let mut workbook = open_workbook_auto(path)?;
    let names: Vec<String> = workbook.sheet_names().to_vec();
    let sheet = select_sheet(&names, selection)?;
    let range = workbook.worksheet_range(&sheet)?;

    let mut rows = range
        .rows()
        .map(|row| row.iter().map(cell_to_text).collect::<Vec<String>>())
        .filter(|row| row.iter().any(|c| !c.trim().is_empty()));

    let header = rows.next().ok_or(NormalizeFailure::MissingHeader)?;
    let mut rows: Vec<Vec<String>> = rows.collect();

    // Trailing columns that are blank everywhere are not part of the table.
    let width = std::iter::once(&header)
        .chain(rows.iter())
        .map(|row| row.iter().rposition(|c| !c.trim().is_empty()).map_or(0, |i| i + 1))
        .max()
        .unwrap_or(0);

    let mut header = header;
    header.truncate(width);
    let header = canonical_header(header, width);
    for row in &mut rows {
        row.resize(width, String::new());
    }

    Ok(SheetTable {
        sheet,
        header,
        rows,
    })
}

/// Resolve `selection` against the workbook's sheet names.
pub fn select_sheet(names: &[String], selection: &SheetSelection) -> Result<String, NormalizeFailure> {
    if names.is_empty() {
        return Err(NormalizeFailure::NoSheets);
    }
    let found = match selection {
        SheetSelection::First => names.first(),
        SheetSelection::Named(name) => names.iter().find(|n| *n == name),
        SheetSelection::Index(idx) => names.get(*idx),
    };
    found.cloned().ok_or_else(|| NormalizeFailure::SheetNotFound {
        sheet: match selection {
            SheetSelection::Named(name) => format!("'{name}'"),
            SheetSelection::Index(idx) => format!("#{idx}"),
            SheetSelection::First => "#0".to_string(),
        },
        available: names.to_vec(),
    })
}

/// Render a cell the way a spreadsheet displays it.
pub fn cell_to_text(c: &Data) -> String {
    match c {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => format_float(*f),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => {
            if dt.is_duration() {
                return dt.to_string();
            }
            match dt.as_datetime() {
                Some(ndt) if ndt.hour() == 0 && ndt.minute() == 0 && ndt.second() == 0 => {
                    ndt.format("%Y-%m-%d").to_string()
                }
                Some(ndt) => ndt.format("%Y-%m-%d %H:%M:%S").to_string(),
                None => dt.to_string(),
            }
        }
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
        Data::Error(e) => e.to_string(),
    }
}

fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        (f as i64).to_string()
    } else {
        f.to_string()
    }
}
