//! Geometry loader: runs `ogr2ogr` to load a normalized file into the destination table.
//!
//! A zero exit code alone is not success. After the process exits the loader checks that the
//! table exists and, when the source carried data rows, that it is non-empty.

pub mod process;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::database::SpatialDatabase;
use crate::error::{LoaderError, LoaderResult, Stage, ToolFailure};
use crate::job::{ConnectionParams, Job};
use crate::types::{LoadResult, SourceFile, TableRef};

pub use process::{InvokeError, ProcessInvoker, ToolInvocation, ToolInvoker, ToolOutput};

/// How to build the `ogr2ogr` command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ogr2ogr {
    /// Executable name or path.
    pub program: PathBuf,
    /// Name of the geometry column ogr2ogr creates for spatial inputs.
    pub geometry_column: String,
    /// Kill the process after this long; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for Ogr2ogr {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ogr2ogr"),
            geometry_column: crate::georeferencer::DEFAULT_GEOMETRY_COLUMN.to_string(),
            timeout: None,
        }
    }
}

impl Ogr2ogr {
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_geometry_column(mut self, column: impl Into<String>) -> Self {
        self.geometry_column = column.into();
        self
    }

    /// Command that loads `source` into `table`.
    ///
    /// Every CSV field is loaded as text (`AUTODETECT_TYPE=NO`); typing happens later in the
    /// georeferencer.
    pub fn invocation(
        &self,
        table: &TableRef,
        source: &SourceFile,
        connection: &ConnectionParams,
    ) -> ToolInvocation {
        let layer = table.to_string();
        let args = vec![
            "-f".to_string(),
            "PostgreSQL".to_string(),
            connection.ogr_datasource(),
            "-nln".to_string(),
            layer.clone(),
            "-lco".to_string(),
            format!("GEOMETRY_NAME={}", self.geometry_column),
            "-lco".to_string(),
            "DIM=2".to_string(),
            "-oo".to_string(),
            "AUTODETECT_TYPE=NO".to_string(),
            source.path().display().to_string(),
        ];
        ToolInvocation {
            program: self.program.clone(),
            args,
            env: vec![
                ("PGCLIENTENCODING".to_string(), "UTF-8".to_string()),
                ("PG_USE_COPY".to_string(), "YES".to_string()),
            ],
            source: source.path().to_path_buf(),
            layer,
        }
    }
}

/// Loads normalized files through an external tool.
#[derive(Clone)]
pub struct GeometryLoader {
    command: Ogr2ogr,
    invoker: Arc<dyn ToolInvoker>,
}

impl std::fmt::Debug for GeometryLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeometryLoader")
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl GeometryLoader {
    pub fn new(command: Ogr2ogr, invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { command, invoker }
    }

    /// Loader that spawns real `ogr2ogr` processes.
    pub fn with_process(command: Ogr2ogr) -> Self {
        Self::new(command, Arc::new(ProcessInvoker::new()))
    }

    pub fn command(&self) -> &Ogr2ogr {
        &self.command
    }

    /// Load `source` into the job's table and verify the result in `db`.
    pub fn load(
        &self,
        job: &Job,
        source: &SourceFile,
        db: &dyn SpatialDatabase,
    ) -> LoaderResult<LoadResult> {
        self.load_upload(job, source, source.path(), db)
    }

    /// Like [`load`](Self::load), for a `source` normalized from the file at `upload`.
    ///
    /// Errors name `upload`; the normalized file is scratch and gone by the time they are read.
    pub fn load_upload(
        &self,
        job: &Job,
        source: &SourceFile,
        upload: &Path,
        db: &dyn SpatialDatabase,
    ) -> LoaderResult<LoadResult> {
        let table = job.table();
        let connection = job.connection();
        let invocation = self.command.invocation(&table, source, connection);

        job.log(format!(
            "Running {}",
            connection.redact(&invocation.command_line())
        ));
        debug!(layer = %invocation.layer, source = %source.path().display(), "invoking geometry tool");

        let started = Instant::now();
        let output = match self.invoker.invoke(&invocation, self.command.timeout) {
            Ok(output) => output,
            Err(InvokeError::TimedOut { output, .. }) => {
                job.log(format!(
                    "ogr2ogr killed after {:?}; output: {}",
                    output.elapsed,
                    connection.redact(&combined(&output))
                ));
                return Err(LoaderError::Timeout {
                    path: upload.to_path_buf(),
                    table,
                    elapsed: output.elapsed,
                    stdout: connection.redact(&output.stdout),
                    stderr: connection.redact(&output.stderr),
                });
            }
            Err(e) => {
                let e = connection.redact(&e.to_string());
                job.log(format!("ogr2ogr could not run: {e}"));
                return Err(LoaderError::ExternalToolFailure {
                    path: upload.to_path_buf(),
                    table,
                    reason: ToolFailure::Spawn(e),
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    elapsed: started.elapsed(),
                });
            }
        };

        let stdout = connection.redact(&output.stdout);
        let stderr = connection.redact(&output.stderr);
        job.log(format!(
            "ogr2ogr exit code: {} output: {}",
            output
                .exit_code
                .map_or_else(|| "signal".to_string(), |c| c.to_string()),
            connection.redact(&combined(&output))
        ));

        let failure = |reason: ToolFailure, stdout: String, stderr: String| {
            LoaderError::ExternalToolFailure {
                path: upload.to_path_buf(),
                table: table.clone(),
                reason,
                exit_code: output.exit_code,
                stdout,
                stderr,
                elapsed: output.elapsed,
            }
        };

        if !output.success() {
            return Err(failure(ToolFailure::NonZeroExit, stdout, stderr));
        }

        let database = |source| LoaderError::Database {
            stage: Stage::Load,
            table: table.clone(),
            source,
        };
        if !db.table_exists(&table).map_err(database)? {
            return Err(failure(ToolFailure::MissingTable, stdout, stderr));
        }
        let rows = db.row_count(&table).map_err(database)?;
        if rows == 0 {
            let had_rows = source.has_data_rows().map_err(|e| LoaderError::Io {
                stage: Stage::Load,
                path: source.path().to_path_buf(),
                source: e,
            })?;
            if had_rows {
                return Err(failure(ToolFailure::EmptyTable, stdout, stderr));
            }
        }

        info!(table = %table, rows, elapsed_ms = output.elapsed.as_millis() as u64, "geometry tool loaded table");
        Ok(LoadResult {
            exit_code: 0,
            stdout,
            stderr,
            elapsed: output.elapsed,
            rows,
        })
    }
}

fn combined(output: &ToolOutput) -> String {
    let out = output.stdout.trim_end();
    let err = output.stderr.trim_end();
    match (out.is_empty(), err.is_empty()) {
        (true, true) => String::new(),
        (false, true) => out.to_string(),
        (true, false) => err.to_string(),
        (false, false) => format!("{out}\n{err}"),
    }
}
