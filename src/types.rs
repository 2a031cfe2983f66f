//! Core data model of a pipeline run.
//!
//! A run starts from a [`SourceFile`], produces one [`NormalizerResult`] per applied normalizer,
//! one [`LoadResult`] from the geometry tool, and ends with a [`LoadedTable`].

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::georeferencer::GeoreferenceOutcome;
use crate::normalize::Normalizer;

/// An input artifact: path, detected extension, and size.
///
/// Values are immutable; every normalization stage produces a new `SourceFile` so earlier
/// stages' outputs stay inspectable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    path: PathBuf,
    extension: String,
    size: u64,
}

impl SourceFile {
    /// Describe an existing, readable file.
    ///
    /// The extension is taken from the file name (lowercased), never from content.
    pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let meta = fs::metadata(&path)?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            ));
        }
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default();
        Ok(Self {
            path,
            extension,
            size: meta.len(),
        })
    }

    /// Full filesystem path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lowercased extension without the dot (empty when the name has none).
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Size in bytes at the time the value was created.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// File name without its extension, used to name derived files.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string())
    }

    /// Whether the file carries any data beyond a header.
    ///
    /// For canonical CSV this means at least one record after the header row; other formats
    /// are opaque to the pipeline, so any non-empty file counts.
    pub fn has_data_rows(&self) -> io::Result<bool> {
        if self.size == 0 {
            return Ok(false);
        }
        if self.extension != "csv" {
            return Ok(true);
        }
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&self.path)
            .map_err(io::Error::from)?;
        match rdr.records().next() {
            Some(record) => record.map(|_| true).map_err(io::Error::from),
            None => Ok(false),
        }
    }
}

/// A destination table: schema plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    /// Database schema the table lives in.
    pub schema: String,
    /// Unqualified table name.
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Logical type of a destination column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    /// Geometry column; `srid == 0` means no spatial reference assigned.
    Geometry { srid: i32 },
    /// Any other database type, by its database name.
    Other(String),
}

/// A named, typed destination column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }

    /// Shorthand for a text column, the type the loader gives every CSV field.
    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    /// SRID of a geometry column, `None` for other types.
    pub fn geometry_srid(&self) -> Option<i32> {
        match self.column_type {
            ColumnType::Geometry { srid } => Some(srid),
            _ => None,
        }
    }
}

/// Output of one normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizerResult {
    /// Which normalizer ran.
    pub normalizer: Normalizer,
    /// The file the next stage consumes.
    pub file: SourceFile,
    /// `false` when the normalizer recognized its input as already loadable and passed it
    /// through unchanged.
    pub converted: bool,
}

/// Output of the geometry-loader stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResult {
    /// Process exit code (always 0 for a successful load).
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall-clock duration of the process.
    pub elapsed: Duration,
    /// Row count of the destination table after the load.
    pub rows: u64,
}

/// The destination artifact of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedTable {
    /// Schema-qualified identity.
    pub table: TableRef,
    /// Columns after georeferencing, in table order.
    pub columns: Vec<Column>,
    /// Number of rows loaded.
    pub rows: u64,
    /// Normalizers applied, in order.
    pub normalized_by: Vec<Normalizer>,
    /// Geometry tool diagnostics.
    pub load: LoadResult,
    /// Georeferencing trail and terminal state.
    pub georeference: GeoreferenceOutcome,
}

impl LoadedTable {
    /// Column names in table order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn source_file_lowercases_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Points.CSV");
        fs::write(&path, "a\n1\n").unwrap();
        let src = SourceFile::new(&path).unwrap();
        assert_eq!(src.extension(), "csv");
        assert_eq!(src.stem(), "Points");
        assert_eq!(src.size(), 4);
    }

    #[test]
    fn source_file_rejects_directories_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SourceFile::new(dir.path()).is_err());
        assert!(SourceFile::new(dir.path().join("nope.csv")).is_err());
    }

    #[test]
    fn header_only_csv_has_no_data_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.csv");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "name,lat,lon").unwrap();
        drop(f);
        assert!(!SourceFile::new(&path).unwrap().has_data_rows().unwrap());

        fs::write(&path, "name,lat,lon\nx,1,2\n").unwrap();
        assert!(SourceFile::new(&path).unwrap().has_data_rows().unwrap());
    }
}
