//! The pipeline orchestrator.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, info_span, warn};

use crate::config::LoaderConfig;
use crate::database::SpatialDatabase;
use crate::error::{LoaderError, LoaderResult, Stage};
use crate::geometry_loader::GeometryLoader;
use crate::georeferencer::Georeferencer;
use crate::job::Job;
use crate::normalize::{run_chain, NormalizeOptions, Scratch};
use crate::types::{LoadedTable, SourceFile};

/// Runs one upload through normalize, load, and georeference.
///
/// A `Loader` holds no per-run state: `run` takes `&self`, and one instance can serve many
/// concurrent runs as long as each targets its own table.
pub struct Loader {
    db: Arc<dyn SpatialDatabase>,
    geometry_loader: GeometryLoader,
    georeferencer: Georeferencer,
    options: NormalizeOptions,
    work_dir: PathBuf,
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("geometry_loader", &self.geometry_loader)
            .field("georeferencer", &self.georeferencer)
            .field("options", &self.options)
            .field("work_dir", &self.work_dir)
            .finish_non_exhaustive()
    }
}

impl Loader {
    pub fn new(
        db: Arc<dyn SpatialDatabase>,
        geometry_loader: GeometryLoader,
        georeferencer: Georeferencer,
        options: NormalizeOptions,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db,
            geometry_loader,
            georeferencer,
            options,
            work_dir: work_dir.into(),
        }
    }

    /// Build a loader that runs the real `ogr2ogr` as `config` describes.
    pub fn from_config(
        config: &LoaderConfig,
        db: Arc<dyn SpatialDatabase>,
    ) -> Result<Self, crate::config::ConfigError> {
        Ok(Self::new(
            db,
            GeometryLoader::with_process(config.ogr2ogr_command()),
            Georeferencer::new(config.geometry_column.clone(), config.srid),
            config.normalize_options()?,
            config.work_dir(),
        ))
    }

    pub fn database(&self) -> &Arc<dyn SpatialDatabase> {
        &self.db
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Describe the file at `path` and [`run`](Self::run) it.
    pub fn run_path(&self, job: &Job, path: impl AsRef<Path>) -> LoaderResult<LoadedTable> {
        let path = path.as_ref();
        let source = SourceFile::new(path).map_err(|e| LoaderError::Io {
            stage: Stage::Normalize,
            path: path.to_path_buf(),
            source: e,
        })?;
        self.run(job, &source)
    }

    /// Normalize `source`, load it into the job's table, and georeference the table.
    ///
    /// Aborts at the first failing stage. If loading or georeferencing fails, the partially
    /// written table is dropped, unless it existed before this run. Intermediate files are
    /// removed before returning either way.
    pub fn run(&self, job: &Job, source: &SourceFile) -> LoaderResult<LoadedTable> {
        let table = job.table();
        let span = info_span!("load_file", table = %table, file = %source.path().display());
        let _guard = span.enter();

        job.log(format!(
            "Using database connection with {}",
            job.connection().redacted()
        ));
        job.log(format!(
            "normalize: {} ({} bytes, .{})",
            source.path().display(),
            source.size(),
            source.extension()
        ));

        fs::create_dir_all(&self.work_dir).map_err(|e| LoaderError::Io {
            stage: Stage::Normalize,
            path: self.work_dir.clone(),
            source: e,
        })?;
        let mut scratch = Scratch::new(&self.work_dir);
        let normalized = run_chain(source, &self.options, &mut scratch, job)?;

        let preexisting = self
            .db
            .table_exists(&table)
            .map_err(|source| LoaderError::Database {
                stage: Stage::Load,
                table: table.clone(),
                source,
            })?;
        if preexisting {
            job.log(format!("{table} already exists; it will be kept if this run fails"));
        }

        job.log(format!(
            "load: {} into {table}",
            normalized.file.path().display()
        ));
        let abandon = |e: LoaderError| -> LoaderError {
            if preexisting {
                job.log(format!("{} failed: {e}", e.stage()));
                e
            } else {
                self.abandon(job, e)
            }
        };
        let load = match self.geometry_loader.load_upload(
            job,
            &normalized.file,
            source.path(),
            self.db.as_ref(),
        ) {
            Ok(load) => load,
            Err(e) => return Err(abandon(e)),
        };

        job.log(format!("georeference: {table} ({} rows)", load.rows));
        let georeference = match self.georeferencer.run(job, self.db.as_ref()) {
            Ok(outcome) => outcome,
            Err(e) => return Err(abandon(e)),
        };

        let columns = match self.db.columns(&table) {
            Ok(columns) => columns,
            Err(source) => {
                let e = LoaderError::Database {
                    stage: Stage::Georeference,
                    table: table.clone(),
                    source,
                };
                return Err(abandon(e));
            }
        };

        job.log(format!(
            "done: {table} loaded with {} rows, georeference state {:?}",
            load.rows,
            georeference.state()
        ));
        info!(
            rows = load.rows,
            columns = columns.len(),
            referenced = georeference.is_referenced(),
            "upload loaded"
        );

        Ok(LoadedTable {
            table,
            columns,
            rows: load.rows,
            normalized_by: normalized.normalizers(),
            load,
            georeference,
        })
    }

    // Drop whatever the failed run left in the destination and hand the error back.
    fn abandon(&self, job: &Job, error: LoaderError) -> LoaderError {
        let table = job.table();
        job.log(format!("{} failed: {error}", error.stage()));
        match self.db.table_exists(&table) {
            Ok(true) => match self.db.drop_table(&table) {
                Ok(()) => job.log(format!("dropped partially loaded table {table}")),
                Err(e) => warn!(table = %table, error = %e, "could not drop partially loaded table"),
            },
            Ok(false) => {}
            Err(e) => warn!(table = %table, error = %e, "could not check for partially loaded table"),
        }
        error
    }
}
