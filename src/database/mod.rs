//! Destination database seam.
//!
//! The pipeline touches the destination only through [`SpatialDatabase`]: the geometry loader
//! checks that the table exists and holds rows, and the georeferencer lists columns and adds or
//! fixes a geometry column. Two backends ship with the crate:
//!
//! - [`memory::MemoryDatabase`]: in-process tables, for tests and dry runs
//! - `postgis::PostgisDatabase` (feature `postgis`): PostgreSQL/PostGIS through sqlx

pub mod memory;
#[cfg(feature = "postgis")]
pub mod postgis;

use thiserror::Error;

use crate::types::{Column, TableRef};

/// Error type returned by [`SpatialDatabase`] implementations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("table {0} does not exist")]
    MissingTable(TableRef),

    #[error("table {0} already exists")]
    TableExists(TableRef),

    #[error("column '{column}' not found in {table}")]
    MissingColumn { table: TableRef, column: String },

    #[error("column '{column}' already exists in {table}")]
    DuplicateColumn { table: TableRef, column: String },

    /// Source text of a geometry conversion is not valid geometry.
    #[error("invalid geometry in column '{column}'{}: {message}", row.map(|r| format!(" at row {r}")).unwrap_or_default())]
    InvalidGeometry {
        column: String,
        row: Option<u64>,
        value: Option<String>,
        message: String,
    },

    /// Connection, protocol, or other backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Text encoding of a geometry column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryEncoding {
    /// Well-known text, optionally with an `SRID=n;` prefix.
    Wkt,
    /// Hex-encoded (E)WKB.
    WkbHex,
    /// A GeoJSON geometry object.
    GeoJson,
}

/// Where a new geometry column takes its values from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeometrySource {
    /// Points from a latitude and a longitude column.
    LatLon { latitude: String, longitude: String },
    /// Parsed from a text column.
    Text {
        column: String,
        encoding: GeometryEncoding,
    },
}

impl GeometrySource {
    /// Columns the conversion reads.
    pub fn columns(&self) -> Vec<&str> {
        match self {
            GeometrySource::LatLon {
                latitude,
                longitude,
            } => vec![latitude.as_str(), longitude.as_str()],
            GeometrySource::Text { column, .. } => vec![column.as_str()],
        }
    }
}

/// Operations the pipeline performs on the destination database.
///
/// Implementations must be safe to share between concurrent runs that target distinct tables.
pub trait SpatialDatabase: Send + Sync {
    /// Whether `table` exists.
    fn table_exists(&self, table: &TableRef) -> Result<bool, DatabaseError>;

    /// Number of rows in `table`.
    fn row_count(&self, table: &TableRef) -> Result<u64, DatabaseError>;

    /// Columns of `table`, in table order.
    fn columns(&self, table: &TableRef) -> Result<Vec<Column>, DatabaseError>;

    /// Up to `limit` non-blank values of `column`, as text.
    fn sample_values(
        &self,
        table: &TableRef,
        column: &str,
        limit: usize,
    ) -> Result<Vec<String>, DatabaseError>;

    /// Add geometry column `column` with `srid`, filled from `source`.
    ///
    /// Blank source cells yield NULL geometry. Any malformed non-blank value fails the whole
    /// operation with [`DatabaseError::InvalidGeometry`] and leaves the table unchanged.
    /// Returns the number of non-NULL geometries written.
    fn add_geometry_column(
        &self,
        table: &TableRef,
        column: &str,
        source: &GeometrySource,
        srid: i32,
    ) -> Result<u64, DatabaseError>;

    /// Assign `srid` to an existing geometry column without changing coordinates.
    fn set_srid(&self, table: &TableRef, column: &str, srid: i32) -> Result<(), DatabaseError>;

    /// Drop `table` if it exists.
    fn drop_table(&self, table: &TableRef) -> Result<(), DatabaseError>;
}
