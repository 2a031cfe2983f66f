//! `geo-ingest`: load uploads into PostGIS from the command line.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;

use geo_ingest::batch::{expand_inputs, plan_tables, BatchOutcome, BatchRunner};
use geo_ingest::config::LoaderConfig;
use geo_ingest::database::postgis::PostgisDatabase;
use geo_ingest::georeferencer::GeoreferenceState;
use geo_ingest::job::Job;
use geo_ingest::loader::Loader;
use geo_ingest::observability::{CompositeJobLog, FileJobLog, JobLog, TracingJobLog};
use geo_ingest::{logging, Disposition};

#[derive(Debug, Parser)]
#[command(name = "geo-ingest", version, about = "Normalize, load, and georeference uploads")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, short, global = true, env = "GEO_INGEST_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load files (or glob patterns) into the destination database.
    Load {
        /// Files or glob patterns.
        #[arg(required = true)]
        inputs: Vec<String>,

        /// Destination table name; derived from each file name when omitted.
        #[arg(long, short)]
        table: Option<String>,

        /// Destination schema (overrides the config).
        #[arg(long)]
        schema: Option<String>,

        /// Maximum concurrent runs (overrides the config).
        #[arg(long, short)]
        jobs: Option<usize>,

        /// Also append job log lines to this file.
        #[arg(long)]
        job_log: Option<PathBuf>,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();

    match execute(cli) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("Error: {e:#}");
            process::exit(2);
        }
    }
}

fn execute(cli: Cli) -> Result<bool> {
    let config = match &cli.config {
        Some(path) => LoaderConfig::from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => LoaderConfig::default(),
    };
    let mut config = config.with_env_overrides()?;

    match cli.command {
        Command::Load {
            inputs,
            table,
            schema,
            jobs,
            job_log,
        } => {
            if let Some(schema) = schema {
                config.schema = schema;
            }
            if let Some(jobs) = jobs {
                config.max_parallel_runs = jobs;
            }
            config.validate()?;
            load(&config, &inputs, table.as_deref(), job_log)
        }
    }
}

fn load(
    config: &LoaderConfig,
    inputs: &[String],
    table: Option<&str>,
    job_log: Option<PathBuf>,
) -> Result<bool> {
    let Some(connection) = config.database.clone() else {
        bail!("no [database] section in the configuration");
    };

    let db = PostgisDatabase::connect(&connection)
        .with_context(|| format!("connecting to {}", connection.redacted()))?;
    let loader = Arc::new(Loader::from_config(config, Arc::new(db))?);

    let paths = expand_inputs(inputs)?;
    let items = plan_tables(&paths, table);

    let mut sinks: Vec<Arc<dyn JobLog>> = vec![Arc::new(TracingJobLog)];
    if let Some(path) = job_log {
        sinks.push(Arc::new(FileJobLog::new(path)));
    }
    let log: Arc<dyn JobLog> = Arc::new(CompositeJobLog::new(sinks));

    let runner = BatchRunner::new(loader, config.max_parallel_runs)?;
    let outcomes = runner.run(items, |item| {
        Job::new(item.table_name.clone(), connection.clone(), Arc::clone(&log))
            .with_schema(config.schema.clone())
    });

    let mut all_ok = true;
    for outcome in &outcomes {
        all_ok &= report(outcome);
    }
    Ok(all_ok)
}

fn report(outcome: &BatchOutcome) -> bool {
    let file = outcome.item.path.display();
    match &outcome.result {
        Ok(loaded) => {
            let state = match loaded.georeference.state() {
                GeoreferenceState::Referenced { column, srid } => format!("{column} srid={srid}"),
                _ => "unreferenced".to_string(),
            };
            println!("ok    {}  rows={}  {state}  {file}", loaded.table, loaded.rows);
            true
        }
        Err(e) => {
            let hint = match e.disposition() {
                Disposition::FixInput => "fix input",
                Disposition::Retry => "retry",
            };
            println!("fail  {file}  [{}] {e} ({hint})", e.stage());
            false
        }
    }
}
