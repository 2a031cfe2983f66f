//! Normalizer set and chain selector.
//!
//! Every upload passes through [`run_chain`] before it reaches the geometry tool:
//!
//! - the file's extension selects the applicable [`Normalizer`]s, in fixed priority order
//!   (delimited text, then spreadsheet, then semi-structured)
//! - each normalizer writes a new canonical CSV into the run's [`Scratch`] directory and the next
//!   one reads it
//! - extensions the geometry tool reads natively pass through untouched
//!
//! Format-specific conversions live in:
//! - [`csv`]
//! - [`excel`] (feature `excel`)
//! - [`json`]

pub mod csv;
pub mod encoding;
#[cfg(feature = "excel")]
pub mod excel;
pub mod json;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tempfile::TempPath;
use tracing::debug;

use crate::error::{LoaderError, LoaderResult, NormalizeFailure, Stage};
use crate::job::Job;
use crate::types::{NormalizerResult, SourceFile};

/// The closed set of normalizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Normalizer {
    /// Separated-values text (CSV family).
    DelimitedText,
    /// Binary or XML spreadsheets.
    Spreadsheet,
    /// JSON arrays of records / NDJSON.
    SemiStructured,
}

/// All normalizers in priority order.
pub const NORMALIZERS: [Normalizer; 3] = [
    Normalizer::DelimitedText,
    Normalizer::Spreadsheet,
    Normalizer::SemiStructured,
];

/// Extensions ogr2ogr reads directly; these need no normalizer.
pub const PASSTHROUGH_EXTENSIONS: &[&str] =
    &["geojson", "shp", "kml", "kmz", "gpx", "gpkg", "zip", "gml"];

impl Normalizer {
    /// Extensions (lowercase, no dot) this normalizer accepts.
    pub fn supported_extensions(self) -> &'static [&'static str] {
        match self {
            Normalizer::DelimitedText => &["csv", "tsv", "txt"],
            Normalizer::Spreadsheet => &["xlsx", "xls", "xlsm", "xlsb", "ods"],
            Normalizer::SemiStructured => &["json", "ndjson"],
        }
    }

    /// Whether this normalizer accepts `extension` (case-insensitive).
    pub fn supports(self, extension: &str) -> bool {
        let ext = extension.to_ascii_lowercase();
        self.supported_extensions().contains(&ext.as_str())
    }

    /// Stable identity used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Normalizer::DelimitedText => "delimited-text",
            Normalizer::Spreadsheet => "spreadsheet",
            Normalizer::SemiStructured => "semi-structured",
        }
    }

    /// Convert `source` into canonical CSV inside `scratch`.
    pub fn convert(
        self,
        source: &SourceFile,
        options: &NormalizeOptions,
        scratch: &mut Scratch,
    ) -> Result<NormalizerResult, NormalizeFailure> {
        match self {
            Normalizer::DelimitedText => csv::normalize_delimited(source, options, scratch),
            Normalizer::Spreadsheet => convert_spreadsheet(source, options, scratch),
            Normalizer::SemiStructured => json::flatten_json(source, scratch),
        }
    }
}

impl fmt::Display for Normalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg_attr(not(feature = "excel"), allow(unused_variables))]
fn convert_spreadsheet(
    source: &SourceFile,
    options: &NormalizeOptions,
    scratch: &mut Scratch,
) -> Result<NormalizerResult, NormalizeFailure> {
    #[cfg(feature = "excel")]
    {
        excel::convert_workbook(source, &options.sheet, scratch)
    }

    #[cfg(not(feature = "excel"))]
    {
        Err(NormalizeFailure::FeatureDisabled)
    }
}

/// Normalizers applicable to `extension`, in priority order.
pub fn normalizers_for(extension: &str) -> Vec<Normalizer> {
    NORMALIZERS
        .iter()
        .copied()
        .filter(|n| n.supports(extension))
        .collect()
}

/// Whether the geometry tool can read `extension` without normalization.
pub fn is_passthrough(extension: &str) -> bool {
    let ext = extension.to_ascii_lowercase();
    PASSTHROUGH_EXTENSIONS.contains(&ext.as_str())
}

/// How to choose the sheet of a multi-sheet workbook.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetSelection {
    /// The first sheet in workbook order (default).
    #[default]
    First,
    /// A sheet by exact name.
    Named(String),
    /// A sheet by zero-based position in workbook order.
    Index(usize),
}

/// Options shared by all normalizers.
#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    /// Sheet to extract from workbooks.
    pub sheet: SheetSelection,
    /// Encoding forced on delimited text without a byte-order mark; `None` auto-detects.
    pub encoding: Option<&'static encoding_rs::Encoding>,
}

impl NormalizeOptions {
    /// Force a delimited-text encoding by WHATWG label (e.g. `latin1`, `windows-1252`).
    pub fn with_encoding_label(mut self, label: &str) -> Result<Self, NormalizeFailure> {
        let encoding = encoding_rs::Encoding::for_label(label.trim().as_bytes())
            .ok_or_else(|| NormalizeFailure::UnknownEncodingLabel(label.to_string()))?;
        self.encoding = Some(encoding);
        Ok(self)
    }
}

/// Scope guard owning a run's intermediate files.
///
/// Each file gets a unique name inside the caller's working directory, so concurrent runs
/// sharing a directory never collide. All files are deleted when the guard is dropped,
/// whether the run succeeded or failed.
#[derive(Debug)]
pub struct Scratch {
    dir: PathBuf,
    files: Vec<TempPath>,
}

impl Scratch {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            files: Vec::new(),
        }
    }

    /// Reserve a new empty file named `<stem>.<random>.<extension>`.
    pub fn create(&mut self, stem: &str, extension: &str) -> io::Result<PathBuf> {
        let file = tempfile::Builder::new()
            .prefix(&format!("{stem}."))
            .suffix(&format!(".{extension}"))
            .tempfile_in(&self.dir)?;
        let path = file.into_temp_path();
        let out = path.to_path_buf();
        self.files.push(path);
        Ok(out)
    }

    /// Paths of the files created so far.
    pub fn paths(&self) -> Vec<&Path> {
        self.files.iter().map(|p| &**p as &Path).collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if !self.files.is_empty() {
            debug!(dir = %self.dir.display(), files = self.files.len(), "removing scratch files");
        }
    }
}

/// Final file of a normalizer chain plus every stage's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSource {
    pub file: SourceFile,
    pub stages: Vec<NormalizerResult>,
}

impl NormalizedSource {
    /// Normalizers that ran, in order.
    pub fn normalizers(&self) -> Vec<Normalizer> {
        self.stages.iter().map(|s| s.normalizer).collect()
    }
}

/// Select the normalizers for `source` and thread it through them.
///
/// Zero applicable normalizers is valid only for extensions the geometry tool reads
/// natively; anything else is [`LoaderError::UnsupportedFormat`]. The first failing
/// normalizer aborts the chain; outputs of earlier stages are only mentioned in the job log.
pub fn run_chain(
    source: &SourceFile,
    options: &NormalizeOptions,
    scratch: &mut Scratch,
    job: &Job,
) -> LoaderResult<NormalizedSource> {
    fs::File::open(source.path()).map_err(|e| LoaderError::Io {
        stage: Stage::Normalize,
        path: source.path().to_path_buf(),
        source: e,
    })?;

    let chain = normalizers_for(source.extension());
    if chain.is_empty() {
        if is_passthrough(source.extension()) {
            job.log(format!(
                "normalize: no normalizer for .{}, passing {} through",
                source.extension(),
                source.path().display()
            ));
            return Ok(NormalizedSource {
                file: source.clone(),
                stages: Vec::new(),
            });
        }
        return Err(LoaderError::UnsupportedFormat {
            path: source.path().to_path_buf(),
            extension: source.extension().to_string(),
        });
    }

    let mut current = source.clone();
    let mut stages: Vec<NormalizerResult> = Vec::with_capacity(chain.len());
    for normalizer in chain {
        match normalizer.convert(&current, options, scratch) {
            Ok(result) => {
                job.log(format!(
                    "normalize: {normalizer} {} -> {}",
                    current.path().display(),
                    result.file.path().display()
                ));
                debug!(
                    normalizer = normalizer.name(),
                    input = %current.path().display(),
                    output = %result.file.path().display(),
                    converted = result.converted,
                    "normalizer finished"
                );
                current = result.file.clone();
                stages.push(result);
            }
            Err(cause) => {
                for done in &stages {
                    job.log(format!(
                        "normalize: discarding intermediate {} from {}",
                        done.file.path().display(),
                        done.normalizer
                    ));
                }
                return Err(LoaderError::NormalizationFailure {
                    path: current.path().to_path_buf(),
                    normalizer,
                    cause,
                });
            }
        }
    }

    Ok(NormalizedSource {
        file: current,
        stages,
    })
}

/// Header cells trimmed, blank ones named `field_N`, extended to `width` columns.
pub(crate) fn canonical_header(cells: Vec<String>, width: usize) -> Vec<String> {
    let mut header: Vec<String> = cells
        .into_iter()
        .enumerate()
        .map(|(idx, cell)| {
            let name = cell.trim();
            if name.is_empty() {
                format!("field_{}", idx + 1)
            } else {
                name.to_string()
            }
        })
        .collect();
    while header.len() < width {
        header.push(format!("field_{}", header.len() + 1));
    }
    header
}

/// Write a header and rows as comma-delimited UTF-8, padding short rows with empty cells.
pub(crate) fn write_canonical(
    path: &Path,
    header: &[String],
    rows: &[Vec<String>],
) -> Result<(), NormalizeFailure> {
    let mut wtr = ::csv::WriterBuilder::new()
        .delimiter(b',')
        .quote_style(::csv::QuoteStyle::Necessary)
        .from_path(path)?;
    wtr.write_record(header)?;
    let width = header.len();
    for row in rows {
        if row.len() == width {
            wtr.write_record(row)?;
        } else {
            let mut padded = row.clone();
            padded.resize(width, String::new());
            wtr.write_record(&padded)?;
        }
    }
    wtr.flush()?;
    Ok(())
}

/// Build the result value for a file a normalizer just wrote.
pub(crate) fn converted_result(
    normalizer: Normalizer,
    path: &Path,
) -> Result<NormalizerResult, NormalizeFailure> {
    Ok(NormalizerResult {
        normalizer,
        file: SourceFile::new(path)?,
        converted: true,
    })
}
