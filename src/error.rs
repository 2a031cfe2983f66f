use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::database::DatabaseError;
use crate::normalize::Normalizer;
use crate::types::TableRef;

/// Convenience result type for pipeline operations.
pub type LoaderResult<T> = Result<T, LoaderError>;

/// Pipeline stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Normalizer chain (format conversion to canonical CSV).
    Normalize,
    /// External geometry tool invocation and load verification.
    Load,
    /// Post-load georeferencing.
    Georeference,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Normalize => "normalize",
            Stage::Load => "load",
            Stage::Georeference => "georeference",
        })
    }
}

/// What a caller should do about a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Disposition {
    /// The input file itself is the problem; retrying the same file will fail again.
    FixInput,
    /// Infrastructure failure (I/O, process, database, timeout); the same file may succeed later.
    Retry,
}

/// Why a single normalizer could not convert its input.
#[derive(Debug, Error)]
pub enum NormalizeFailure {
    /// Underlying I/O error (file not found, permission denied, disk full).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV read or write error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[cfg(feature = "excel")]
    /// Spreadsheet read error (feature-gated behind `excel`).
    #[error("spreadsheet error: {0}")]
    Excel(#[from] calamine::Error),

    /// The document is not valid JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The document is neither a JSON value nor valid newline-delimited JSON.
    #[error("invalid ndjson at line {line}: {source}")]
    InvalidNdjson {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// The input has no bytes (or only whitespace).
    #[error("file is empty")]
    EmptyFile,

    /// The character encoding could not be determined or the bytes do not decode.
    #[error("cannot determine character encoding: {reason}")]
    UnknownEncoding { reason: String },

    /// A forced encoding label is not a known WHATWG label.
    #[error("unknown encoding label '{0}'")]
    UnknownEncodingLabel(String),

    /// No non-blank row exists to act as the header.
    #[error("no header row found")]
    MissingHeader,

    /// The workbook contains no sheets.
    #[error("workbook has no sheets")]
    NoSheets,

    /// The designated sheet does not exist.
    #[error("sheet {sheet} not found (available: {available:?})")]
    SheetNotFound { sheet: String, available: Vec<String> },

    /// A JSON element is not an object.
    #[error("record {record} is not a json object")]
    NotARecord { record: usize },

    /// A JSON record holds a nested object or array and cannot be flattened unambiguously.
    #[error("record {record} field '{key}' holds a nested {kind}; cannot flatten")]
    NestedValue {
        record: usize,
        key: String,
        kind: &'static str,
    },

    /// A JSON array with no elements.
    #[error("no records found")]
    NoRecords,

    /// Spreadsheet input without the `excel` feature compiled in.
    #[error("spreadsheet support not enabled (enable cargo feature 'excel')")]
    FeatureDisabled,
}

/// Why the geometry tool stage failed without timing out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolFailure {
    /// The process could not be started or waited on.
    Spawn(String),
    /// The process exited with a non-zero code (or was killed by a signal).
    NonZeroExit,
    /// The process exited 0 but the destination table does not exist.
    MissingTable,
    /// The process exited 0 but the destination table is empty although the source had rows.
    EmptyTable,
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolFailure::Spawn(message) => write!(f, "could not run process: {message}"),
            ToolFailure::NonZeroExit => f.write_str("process exited with failure"),
            ToolFailure::MissingTable => f.write_str("process succeeded but created no table"),
            ToolFailure::EmptyTable => f.write_str("process succeeded but loaded zero rows"),
        }
    }
}

/// Terminal error of a pipeline run.
///
/// Every variant carries enough context (file, stage, cause) to decide whether to fix the input
/// or retry; see [`LoaderError::disposition`].
#[derive(Debug, Error)]
pub enum LoaderError {
    /// No normalizer handles the extension and the geometry tool cannot read it natively.
    #[error("unsupported format '.{extension}' ({})", path.display())]
    UnsupportedFormat { path: PathBuf, extension: String },

    /// A normalizer could not convert its input.
    #[error("normalizer '{normalizer}' failed on {}: {cause}", path.display())]
    NormalizationFailure {
        path: PathBuf,
        normalizer: Normalizer,
        #[source]
        cause: NormalizeFailure,
    },

    /// The geometry tool failed, or reported success without producing rows.
    #[error(
        "ogr2ogr failed loading {} into {table}: {reason} (exit code {exit_code:?}): {stderr}",
        path.display()
    )]
    ExternalToolFailure {
        path: PathBuf,
        table: TableRef,
        reason: ToolFailure,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        elapsed: Duration,
    },

    /// A candidate geometry column could not be converted to valid geometry.
    #[error("georeferencing {table} failed on column '{column}': {message}")]
    GeoreferencingFailure {
        table: TableRef,
        column: String,
        message: String,
    },

    /// The geometry tool exceeded its allotted time and was terminated.
    #[error("ogr2ogr timed out after {elapsed:?} loading {} into {table}", path.display())]
    Timeout {
        path: PathBuf,
        table: TableRef,
        elapsed: Duration,
        stdout: String,
        stderr: String,
    },

    /// File system error outside a specific normalizer.
    #[error("io error during {stage} ({}): {source}", path.display())]
    Io {
        stage: Stage,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Destination database error outside geometry conversion.
    #[error("database error during {stage} on {table}: {source}")]
    Database {
        stage: Stage,
        table: TableRef,
        #[source]
        source: DatabaseError,
    },
}

impl LoaderError {
    /// Stage the run failed in.
    pub fn stage(&self) -> Stage {
        match self {
            LoaderError::UnsupportedFormat { .. } | LoaderError::NormalizationFailure { .. } => {
                Stage::Normalize
            }
            LoaderError::ExternalToolFailure { .. } | LoaderError::Timeout { .. } => Stage::Load,
            LoaderError::GeoreferencingFailure { .. } => Stage::Georeference,
            LoaderError::Io { stage, .. } | LoaderError::Database { stage, .. } => *stage,
        }
    }

    /// Input file the failing stage was working on, when the error is file-scoped.
    pub fn path(&self) -> Option<&Path> {
        match self {
            LoaderError::UnsupportedFormat { path, .. }
            | LoaderError::NormalizationFailure { path, .. }
            | LoaderError::ExternalToolFailure { path, .. }
            | LoaderError::Timeout { path, .. }
            | LoaderError::Io { path, .. } => Some(path),
            LoaderError::GeoreferencingFailure { .. } | LoaderError::Database { .. } => None,
        }
    }

    /// Classify the error for the caller's retry policy.
    pub fn disposition(&self) -> Disposition {
        match self {
            LoaderError::UnsupportedFormat { .. } | LoaderError::GeoreferencingFailure { .. } => {
                Disposition::FixInput
            }
            LoaderError::NormalizationFailure { cause, .. } => disposition_for_normalize(cause),
            LoaderError::ExternalToolFailure { reason, .. } => match reason {
                ToolFailure::Spawn(_) => Disposition::Retry,
                ToolFailure::NonZeroExit | ToolFailure::MissingTable | ToolFailure::EmptyTable => {
                    Disposition::FixInput
                }
            },
            LoaderError::Timeout { .. } | LoaderError::Io { .. } | LoaderError::Database { .. } => {
                Disposition::Retry
            }
        }
    }
}

fn disposition_for_normalize(cause: &NormalizeFailure) -> Disposition {
    match cause {
        NormalizeFailure::Io(_) => Disposition::Retry,
        NormalizeFailure::Csv(err) => match err.kind() {
            ::csv::ErrorKind::Io(_) => Disposition::Retry,
            _ => Disposition::FixInput,
        },
        #[cfg(feature = "excel")]
        NormalizeFailure::Excel(err) => {
            if error_chain_contains_io(err) {
                Disposition::Retry
            } else {
                Disposition::FixInput
            }
        }
        _ => Disposition::FixInput,
    }
}

fn error_chain_contains_io(e: &(dyn StdError + 'static)) -> bool {
    let mut cur: Option<&(dyn StdError + 'static)> = Some(e);
    while let Some(err) = cur {
        if err.is::<std::io::Error>() {
            return true;
        }
        cur = err.source();
    }
    false
}
