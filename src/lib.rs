//! `geo-ingest` turns user uploads into georeferenced PostGIS tables.
//!
//! A run has three stages:
//!
//! 1. **Normalize**: the file extension selects a chain of [`normalize::Normalizer`]s that
//!    rewrite delimited text, spreadsheets, and JSON records into canonical CSV (comma-delimited,
//!    UTF-8, one header row, consistent column count). Formats `ogr2ogr` reads natively
//!    (GeoJSON, Shapefile, KML, ...) pass through.
//! 2. **Load**: [`geometry_loader::GeometryLoader`] runs `ogr2ogr` to copy the file into the
//!    destination table and checks that the table exists and holds rows.
//! 3. **Georeference**: [`georeferencer::Georeferencer`] finds latitude/longitude pairs or
//!    geometry text and adds a geometry column in the configured SRID (default 4326).
//!
//! [`loader::Loader`] strings the stages together; [`batch::BatchRunner`] runs many files in
//! parallel.
//!
//! ## What you can load
//!
//! - **Delimited text**: `.csv`, `.tsv`, `.txt` (delimiter and encoding detected)
//! - **Spreadsheets** (requires the Cargo feature `excel`): `.xlsx`, `.xls`, `.xlsm`, `.xlsb`, `.ods`
//! - **JSON records**: `.json` (array of objects, single object, or NDJSON), `.ndjson`
//! - **Native geometry formats**: `.geojson`, `.shp`, `.kml`, `.kmz`, `.gpx`, `.gpkg`, `.zip`, `.gml`
//!
//! ## Quick example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use geo_ingest::database::memory::MemoryDatabase;
//! use geo_ingest::geometry_loader::{GeometryLoader, Ogr2ogr};
//! use geo_ingest::georeferencer::Georeferencer;
//! use geo_ingest::job::{ConnectionParams, Job};
//! use geo_ingest::loader::Loader;
//! use geo_ingest::normalize::NormalizeOptions;
//! use geo_ingest::observability::MemoryJobLog;
//!
//! # fn main() -> Result<(), geo_ingest::LoaderError> {
//! let loader = Loader::new(
//!     Arc::new(MemoryDatabase::new()),
//!     GeometryLoader::with_process(Ogr2ogr::default()),
//!     Georeferencer::default(),
//!     NormalizeOptions::default(),
//!     std::env::temp_dir(),
//! );
//! let conn = ConnectionParams::new("localhost", 5432, "carto", "importer");
//! let job = Job::new("points", conn, Arc::new(MemoryJobLog::default()));
//! let table = loader.run_path(&job, "points.xlsx")?;
//! println!("{} rows in {}", table.rows, table.table);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`normalize`]: normalizer set, chain selection, scratch files
//! - [`geometry_loader`]: `ogr2ogr` command and process invocation
//! - [`georeferencer`]: location column detection and geometry creation
//! - [`database`]: destination seam ([`database::SpatialDatabase`]) and backends
//! - [`loader`] / [`batch`]: orchestration
//! - [`job`] / [`observability`]: run context and job log sinks
//! - [`config`]: TOML + environment configuration
//! - [`error`]: error types and retry classification

pub mod batch;
pub mod config;
pub mod database;
pub mod error;
pub mod geometry_loader;
pub mod georeferencer;
pub mod job;
pub mod loader;
#[cfg(feature = "cli")]
pub mod logging;
pub mod normalize;
pub mod observability;
pub mod types;

pub use error::{Disposition, LoaderError, LoaderResult, NormalizeFailure, Stage, ToolFailure};
