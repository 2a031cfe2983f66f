//! Delimited-text normalizer.
//!
//! Rules:
//!
//! - Encoding is detected per [`super::encoding`] and the output is always UTF-8.
//! - The delimiter is the most frequent of `,` tab `;` `|` on the first non-blank line
//!   (outside quotes); `.tsv` files fall back to tab, everything else to comma.
//! - The first non-blank record is the header; there must be one.
//! - Output is comma-delimited with a consistent column count per row.

use std::fs;

use tracing::debug;

use crate::error::NormalizeFailure;
use crate::types::{NormalizerResult, SourceFile};

use super::{
    canonical_header, converted_result, encoding, write_canonical, NormalizeOptions, Normalizer,
    Scratch,
};

/// Candidate delimiters; on equal counts the earlier one wins.
pub const DELIMITER_CANDIDATES: [u8; 4] = [b',', b'\t', b';', b'|'];

/// A parsed separated-values file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelimitedTable {
    /// Delimiter the input used.
    pub delimiter: u8,
    /// Canonical header, as wide as the widest row.
    pub header: Vec<String>,
    /// Data rows (fully blank lines dropped), padded to the header width.
    pub rows: Vec<Vec<String>>,
}

/// Normalize a separated-values file into canonical CSV inside `scratch`.
pub fn normalize_delimited(
    source: &SourceFile,
    options: &NormalizeOptions,
    scratch: &mut Scratch,
) -> Result<NormalizerResult, NormalizeFailure> {
    let bytes = fs::read(source.path())?;
    if bytes.is_empty() {
        return Err(NormalizeFailure::EmptyFile);
    }

    let decoded = encoding::decode(&bytes, options.encoding)?;
    let fallback = if source.extension() == "tsv" {
        b'\t'
    } else {
        b','
    };
    let table = parse_delimited(&decoded.text, fallback)?;

    let out = scratch.create(&source.stem(), "csv")?;
    write_canonical(&out, &table.header, &table.rows)?;

    debug!(
        path = %source.path().display(),
        encoding = decoded.encoding.name(),
        bom = decoded.had_bom,
        delimiter = %char::from(table.delimiter).escape_default(),
        columns = table.header.len(),
        rows = table.rows.len(),
        "normalized delimited text"
    );

    converted_result(Normalizer::DelimitedText, &out)
}

/// Parse decoded text into a [`DelimitedTable`].
pub fn parse_delimited(text: &str, fallback: u8) -> Result<DelimitedTable, NormalizeFailure> {
    if text.trim().is_empty() {
        return Err(NormalizeFailure::EmptyFile);
    }

    let delimiter = detect_delimiter(text).unwrap_or(fallback);
    let mut rdr = ::csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    let mut records: Vec<Vec<String>> = Vec::new();
    for result in rdr.records() {
        let record = result?;
        if record.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        records.push(record.iter().map(str::to_owned).collect());
    }

    let mut records = records.into_iter();
    let header = records.next().ok_or(NormalizeFailure::MissingHeader)?;
    let mut rows: Vec<Vec<String>> = records.collect();

    let width = rows
        .iter()
        .map(Vec::len)
        .chain(std::iter::once(header.len()))
        .max()
        .unwrap_or(0);
    let header = canonical_header(header, width);
    for row in &mut rows {
        row.resize(width, String::new());
    }

    Ok(DelimitedTable {
        delimiter,
        header,
        rows,
    })
}

/// Most frequent candidate delimiter on the first non-blank line, ignoring quoted text.
///
/// Returns `None` when no candidate appears (a single-column file).
pub fn detect_delimiter(text: &str) -> Option<u8> {
    let line = text.lines().find(|l| !l.trim().is_empty())?;

    let mut counts = [0usize; DELIMITER_CANDIDATES.len()];
    let mut in_quotes = false;
    for b in line.bytes() {
        if b == b'"' {
            in_quotes = !in_quotes;
            continue;
        }
        if in_quotes {
            continue;
        }
        if let Some(idx) = DELIMITER_CANDIDATES.iter().position(|&d| d == b) {
            counts[idx] += 1;
        }
    }

    let mut best: Option<(u8, usize)> = None;
    for (idx, &count) in counts.iter().enumerate() {
        if count > best.map(|(_, c)| c).unwrap_or(0) {
            best = Some((DELIMITER_CANDIDATES[idx], count));
        }
    }
    best.map(|(d, _)| d)
}
