//! Loader configuration.
//!
//! Resolution order: built-in defaults, then a TOML file, then `GEO_INGEST_*` environment
//! variables. The database password may also come from `PGPASSWORD`.
//!
//! ```toml
//! ogr2ogr = "/usr/bin/ogr2ogr"
//! timeout_secs = 600
//! schema = "cdb_importer"
//! sheet = { named = "Points" }
//!
//! [database]
//! host = "localhost"
//! database = "carto"
//! user = "importer"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::geometry_loader::Ogr2ogr;
use crate::georeferencer::{DEFAULT_GEOMETRY_COLUMN, DEFAULT_SRID};
use crate::job::{ConnectionParams, DEFAULT_SCHEMA};
use crate::normalize::{NormalizeOptions, SheetSelection};

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "GEO_INGEST_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Everything needed to build a [`crate::loader::Loader`] and its destination.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    /// `ogr2ogr` executable.
    pub ogr2ogr: PathBuf,
    /// Geometry tool time limit; `None` waits indefinitely.
    pub timeout_secs: Option<u64>,
    /// Destination schema.
    pub schema: String,
    pub geometry_column: String,
    pub srid: i32,
    pub sheet: SheetSelection,
    /// Forced encoding label for delimited text.
    pub encoding: Option<String>,
    /// Where intermediate files go; defaults to a directory under the system temp dir.
    pub work_dir: Option<PathBuf>,
    pub max_parallel_runs: usize,
    pub database: Option<ConnectionParams>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            ogr2ogr: PathBuf::from("ogr2ogr"),
            timeout_secs: Some(3600),
            schema: DEFAULT_SCHEMA.to_string(),
            geometry_column: DEFAULT_GEOMETRY_COLUMN.to_string(),
            srid: DEFAULT_SRID,
            sheet: SheetSelection::First,
            encoding: None,
            work_dir: None,
            max_parallel_runs: 4,
            database: None,
        }
    }
}

impl LoaderConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: LoaderConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply `GEO_INGEST_*` overrides (and `PGPASSWORD`) from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = var("OGR2OGR") {
            self.ogr2ogr = PathBuf::from(v);
        }
        if let Some(v) = var("TIMEOUT_SECS") {
            let secs = v
                .parse::<u64>()
                .map_err(|_| ConfigError::invalid("GEO_INGEST_TIMEOUT_SECS", format!("'{v}' is not a number")))?;
            self.timeout_secs = Some(secs);
        }
        if let Some(v) = var("SCHEMA") {
            self.schema = v;
        }
        if let Some(v) = var("WORK_DIR") {
            self.work_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("MAX_PARALLEL_RUNS") {
            self.max_parallel_runs = v.parse::<usize>().map_err(|_| {
                ConfigError::invalid("GEO_INGEST_MAX_PARALLEL_RUNS", format!("'{v}' is not a number"))
            })?;
        }
        if let Some(db) = self.database.as_mut() {
            if db.password.is_none() {
                db.password = lookup("PGPASSWORD").filter(|p| !p.is_empty());
            }
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema.trim().is_empty() {
            return Err(ConfigError::invalid("schema", "must not be empty"));
        }
        if self.geometry_column.trim().is_empty() {
            return Err(ConfigError::invalid("geometry_column", "must not be empty"));
        }
        if self.srid <= 0 {
            return Err(ConfigError::invalid("srid", format!("{} is not a valid srid", self.srid)));
        }
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::invalid("timeout_secs", "must be at least 1"));
        }
        if self.max_parallel_runs == 0 {
            return Err(ConfigError::invalid("max_parallel_runs", "must be at least 1"));
        }
        self.normalize_options()?;
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn normalize_options(&self) -> Result<NormalizeOptions, ConfigError> {
        let options = NormalizeOptions {
            sheet: self.sheet.clone(),
            encoding: None,
        };
        match &self.encoding {
            Some(label) => options
                .with_encoding_label(label)
                .map_err(|e| ConfigError::invalid("encoding", e.to_string())),
            None => Ok(options),
        }
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("geo-ingest"))
    }

    pub fn ogr2ogr_command(&self) -> Ogr2ogr {
        Ogr2ogr::default()
            .with_program(self.ogr2ogr.clone())
            .with_geometry_column(self.geometry_column.clone())
            .with_timeout(self.timeout())
    }
}
