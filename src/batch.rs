//! Running many uploads through one [`Loader`] with bounded parallelism.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;
use tracing::{error, info};

use crate::error::LoaderResult;
use crate::job::Job;
use crate::loader::Loader;
use crate::types::LoadedTable;

/// PostgreSQL truncates identifiers longer than this.
pub const MAX_TABLE_NAME_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("invalid glob pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("cannot read path while expanding '{pattern}': {source}")]
    Glob {
        pattern: String,
        #[source]
        source: glob::GlobError,
    },

    #[error("cannot build thread pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("no input files matched")]
    NoInputs,
}

/// One file of a batch and the table it loads into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub path: PathBuf,
    pub table_name: String,
}

/// Result of one batch item.
#[derive(Debug)]
pub struct BatchOutcome {
    pub item: BatchItem,
    pub result: LoaderResult<LoadedTable>,
}

/// Expand file paths and glob patterns, in argument order, without duplicates.
///
/// Arguments without glob metacharacters are taken literally, so a missing file surfaces as a
/// load error for that item instead of silently matching nothing.
pub fn expand_inputs<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<PathBuf>, BatchError> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for pattern in patterns {
        let pattern = pattern.as_ref();
        if !pattern.contains(['*', '?', '[']) {
            let path = PathBuf::from(pattern);
            if seen.insert(path.clone()) {
                out.push(path);
            }
            continue;
        }
        let paths = glob::glob(pattern).map_err(|source| BatchError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        for entry in paths {
            let path = entry.map_err(|source| BatchError::Glob {
                pattern: pattern.to_string(),
                source,
            })?;
            if path.is_file() && seen.insert(path.clone()) {
                out.push(path);
            }
        }
    }
    if out.is_empty() {
        return Err(BatchError::NoInputs);
    }
    Ok(out)
}

/// Lowercase identifier safe to use unquoted: `[a-z0-9_]`, not starting with a digit,
/// at most [`MAX_TABLE_NAME_LEN`] bytes.
pub fn sanitize_table_name(raw: &str) -> String {
    let mut name: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    while name.contains("__") {
        name = name.replace("__", "_");
    }
    let mut name = name.trim_matches('_').to_string();
    if name.is_empty() {
        name = "untitled_table".to_string();
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert_str(0, "t_");
    }
    name.truncate(MAX_TABLE_NAME_LEN);
    name
}

/// Assign each path a distinct table name.
///
/// Names derive from `base` when given, otherwise from each file stem. A name already used
/// earlier in the batch gets the first free `_N` suffix.
pub fn plan_tables(paths: &[PathBuf], base: Option<&str>) -> Vec<BatchItem> {
    let mut used: HashSet<String> = HashSet::new();
    paths
        .iter()
        .map(|path| {
            let raw = base.map(str::to_string).unwrap_or_else(|| file_stem(path));
            let name = sanitize_table_name(&raw);
            let table_name = if used.contains(&name) {
                (1..)
                    .map(|n| suffixed(&name, n))
                    .find(|candidate| !used.contains(candidate))
                    .unwrap_or_else(|| name.clone())
            } else {
                name
            };
            used.insert(table_name.clone());
            BatchItem {
                path: path.clone(),
                table_name,
            }
        })
        .collect()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn suffixed(name: &str, n: usize) -> String {
    let suffix = format!("_{n}");
    let mut base = name.to_string();
    base.truncate(MAX_TABLE_NAME_LEN - suffix.len());
    base + &suffix
}

/// Runs batch items through a shared [`Loader`] on a bounded rayon pool.
pub struct BatchRunner {
    loader: Arc<Loader>,
    pool: ThreadPool,
    max_parallel_runs: usize,
}

impl BatchRunner {
    /// At most `max_parallel_runs` items run at once (minimum 1).
    pub fn new(loader: Arc<Loader>, max_parallel_runs: usize) -> Result<Self, BatchError> {
        let n = max_parallel_runs.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(n)
            .thread_name(|i| format!("geo-ingest-{i}"))
            .build()?;
        Ok(Self {
            loader,
            pool,
            max_parallel_runs: n,
        })
    }

    pub fn max_parallel_runs(&self) -> usize {
        self.max_parallel_runs
    }

    /// Run every item; `make_job` builds the job for each. Outcomes keep item order and one
    /// failure never stops the others.
    pub fn run<F>(&self, items: Vec<BatchItem>, make_job: F) -> Vec<BatchOutcome>
    where
        F: Fn(&BatchItem) -> Job + Send + Sync,
    {
        let started = Instant::now();
        let total = items.len();
        info!(items = total, parallel = self.max_parallel_runs, "batch started");

        let outcomes: Vec<BatchOutcome> = self.pool.install(|| {
            items
                .into_par_iter()
                .map(|item| {
                    let job = make_job(&item);
                    let result = self.loader.run_path(&job, &item.path);
                    if let Err(e) = &result {
                        error!(
                            file = %item.path.display(),
                            table = %item.table_name,
                            stage = %e.stage(),
                            error = %e,
                            "batch item failed"
                        );
                    }
                    BatchOutcome { item, result }
                })
                .collect()
        });

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        info!(
            items = total,
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_sanitized() {
        assert_eq!(sanitize_table_name("My Points (2024)"), "my_points_2024");
        assert_eq!(sanitize_table_name("2024-sales"), "t_2024_sales");
        assert_eq!(sanitize_table_name("__"), "untitled_table");
        assert_eq!(sanitize_table_name(&"x".repeat(100)).len(), MAX_TABLE_NAME_LEN);
    }

    #[test]
    fn colliding_names_get_suffixes() {
        let paths = vec![
            PathBuf::from("a/points.csv"),
            PathBuf::from("b/points.xlsx"),
            PathBuf::from("c/Points.json"),
            PathBuf::from("d/roads.csv"),
        ];
        let names: Vec<String> = plan_tables(&paths, None)
            .into_iter()
            .map(|i| i.table_name)
            .collect();
        assert_eq!(names, vec!["points", "points_1", "points_2", "roads"]);

        let names: Vec<String> = plan_tables(&paths[..2], Some("upload"))
            .into_iter()
            .map(|i| i.table_name)
            .collect();
        assert_eq!(names, vec!["upload", "upload_1"]);
    }

    #[test]
    fn glob_expansion_keeps_literals_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.csv", "b.csv", "c.json"] {
            std::fs::write(dir.path().join(name), "x\n").unwrap();
        }
        let pattern = format!("{}/*.csv", dir.path().display());
        let literal = dir.path().join("a.csv").display().to_string();
        let paths = expand_inputs(&[pattern, literal]).unwrap();
        assert_eq!(paths.len(), 2);

        let none = format!("{}/*.xlsx", dir.path().display());
        assert!(matches!(expand_inputs(&[none]), Err(BatchError::NoInputs)));
    }
}
