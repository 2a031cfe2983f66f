use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use geo_ingest::database::memory::MemoryDatabase;
use geo_ingest::database::SpatialDatabase;
use geo_ingest::geometry_loader::{
    GeometryLoader, InvokeError, Ogr2ogr, ToolInvocation, ToolInvoker, ToolOutput,
};
use geo_ingest::georeferencer::{GeoreferenceState, Georeferencer};
use geo_ingest::job::{ConnectionParams, Job};
use geo_ingest::loader::Loader;
use geo_ingest::normalize::{NormalizeOptions, Normalizer};
use geo_ingest::observability::MemoryJobLog;
use geo_ingest::types::{Column, TableRef};
use geo_ingest::{Disposition, LoaderError, Stage};

type Invoked = Result<ToolOutput, InvokeError>;

fn ok_output() -> ToolOutput {
    ToolOutput {
        exit_code: Some(0),
        stdout: String::new(),
        stderr: String::new(),
        elapsed: Duration::from_millis(3),
    }
}

// Stands in for ogr2ogr: copies the CSV it is given into the in-memory database.
fn fake_ogr2ogr(db: Arc<MemoryDatabase>) -> Arc<dyn ToolInvoker> {
    Arc::new(move |inv: &ToolInvocation, _: Option<Duration>| -> Invoked {
        let (schema, name) = inv.layer.split_once('.').unwrap();
        db.load_csv(&TableRef::new(schema, name), &inv.source).unwrap();
        Ok(ok_output())
    })
}

fn loader(db: Arc<MemoryDatabase>, work: &Path) -> Loader {
    Loader::new(
        db.clone(),
        GeometryLoader::new(Ogr2ogr::default(), fake_ogr2ogr(db)),
        Georeferencer::default(),
        NormalizeOptions::default(),
        work,
    )
}

fn job(name: &str) -> (Job, Arc<MemoryJobLog>) {
    let log = Arc::new(MemoryJobLog::default());
    let conn =
        ConnectionParams::new("localhost", 5432, "carto", "importer").with_password("hunter2");
    (Job::new(name, conn, log.clone()), log)
}

#[cfg(feature = "excel")]
#[test]
fn spreadsheet_upload_ends_as_a_georeferenced_table() {
    use rust_xlsxwriter::Workbook;

    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let path = dir.path().join("points.xlsx");
    let mut wb = Workbook::new();
    let ws = wb.add_worksheet();
    for (col, name) in ["name", "lat", "lon"].iter().enumerate() {
        ws.write_string(0, col as u16, *name).unwrap();
    }
    let places = [("Sol", 40.4168, -3.7038), ("Prado", 40.4138, -3.6921), ("Retiro", 40.4153, -3.6845)];
    for (i, (name, lat, lon)) in places.iter().enumerate() {
        let row = i as u32 + 1;
        ws.write_string(row, 0, *name).unwrap();
        ws.write_number(row, 1, *lat).unwrap();
        ws.write_number(row, 2, *lon).unwrap();
    }
    wb.save(&path).unwrap();

    let db = Arc::new(MemoryDatabase::new());
    let loader = loader(db.clone(), work.path());
    let (job, log) = job("t1");

    let loaded = loader.run_path(&job, &path).unwrap();

    assert_eq!(loaded.table, TableRef::new("cdb_importer", "t1"));
    assert_eq!(loaded.rows, 3);
    assert_eq!(loaded.normalized_by, vec![Normalizer::Spreadsheet]);
    assert_eq!(loaded.column_names(), vec!["name", "lat", "lon", "the_geom"]);
    assert_eq!(
        loaded.georeference.state(),
        &GeoreferenceState::Referenced {
            column: "the_geom".into(),
            srid: 4326
        }
    );
    assert_eq!(db.row_count(&loaded.table).unwrap(), 3);

    assert!(log.contains("Using database connection with"));
    assert!(!log.lines().iter().any(|l| l.contains("hunter2")));
    // Intermediate CSV is gone; the upload is untouched.
    assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
    assert!(path.exists());
}

#[test]
fn csv_upload_is_loaded_and_referenced() {
    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let path = dir.path().join("stations.csv");
    fs::write(&path, "id;latitude;longitude\n1;52.52;13.40\n2;48.85;2.35\n").unwrap();

    let db = Arc::new(MemoryDatabase::new());
    let loader = loader(db.clone(), work.path());
    let (job, _) = job("stations");

    let loaded = loader.run_path(&job, &path).unwrap();
    assert_eq!(loaded.rows, 2);
    assert_eq!(loaded.normalized_by, vec![Normalizer::DelimitedText]);
    assert!(loaded.georeference.is_referenced());
    let table = db.table(&loaded.table).unwrap();
    assert_eq!(
        table.column_values("the_geom").unwrap(),
        vec![
            Some("SRID=4326;POINT(13.4 52.52)"),
            Some("SRID=4326;POINT(2.35 48.85)")
        ]
    );
}

#[test]
fn georeference_failure_drops_the_partial_table() {
    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.csv");
    fs::write(&path, "name,lat,lon\nA,1,2\nB,not-a-number,3\n").unwrap();

    let db = Arc::new(MemoryDatabase::new());
    let loader = loader(db.clone(), work.path());
    let (job, log) = job("bad");

    let err = loader.run_path(&job, &path).unwrap_err();
    assert!(matches!(err, LoaderError::GeoreferencingFailure { .. }));
    assert_eq!(err.stage(), Stage::Georeference);
    assert!(!db.table_exists(&job.table()).unwrap());
    assert!(log.contains("dropped partially loaded table"));
    assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
}

#[test]
fn unsupported_upload_never_reaches_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.pdf");
    fs::write(&path, b"%PDF-1.4").unwrap();

    let db = Arc::new(MemoryDatabase::new());
    let loader = loader(db.clone(), work.path());
    let (job, _) = job("report");

    let err = loader.run_path(&job, &path).unwrap_err();
    assert!(matches!(err, LoaderError::UnsupportedFormat { .. }));
    assert_eq!(err.disposition(), Disposition::FixInput);
    assert!(db.table_names().is_empty());
}

#[test]
fn missing_upload_is_an_io_error() {
    let work = tempfile::tempdir().unwrap();
    let db = Arc::new(MemoryDatabase::new());
    let loader = loader(db, work.path());
    let (job, _) = job("gone");

    let err = loader
        .run_path(&job, work.path().join("gone.csv"))
        .unwrap_err();
    assert!(matches!(
        err,
        LoaderError::Io {
            stage: Stage::Normalize,
            ..
        }
    ));
    assert_eq!(err.disposition(), Disposition::Retry);
}

#[test]
fn tool_failure_leaves_no_table_behind() {
    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let path = dir.path().join("points.csv");
    fs::write(&path, "name,lat,lon\nA,1,2\n").unwrap();

    let db = Arc::new(MemoryDatabase::new());
    // Creates the table, then reports failure half-way through.
    let half_done = {
        let db = db.clone();
        move |inv: &ToolInvocation, _: Option<Duration>| -> Invoked {
            let (schema, name) = inv.layer.split_once('.').unwrap();
            db.load_csv(&TableRef::new(schema, name), &inv.source).unwrap();
            Ok(ToolOutput {
                exit_code: Some(1),
                stderr: "ERROR 1: COPY statement failed".into(),
                ..ok_output()
            })
        }
    };
    let loader = Loader::new(
        db.clone(),
        GeometryLoader::new(Ogr2ogr::default(), Arc::new(half_done)),
        Georeferencer::default(),
        NormalizeOptions::default(),
        work.path(),
    );
    let (job, _) = job("points");

    let err = loader.run_path(&job, &path).unwrap_err();
    assert_eq!(err.stage(), Stage::Load);
    assert!(err.to_string().contains("COPY statement failed"));
    // The upload, not the deleted intermediate CSV.
    assert_eq!(err.path(), Some(path.as_path()));
    assert!(db.table_names().is_empty());
}

#[test]
fn failed_run_keeps_a_table_it_did_not_create() {
    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let path = dir.path().join("points.csv");
    fs::write(&path, "name,lat,lon\nA,1,2\n").unwrap();

    let db = Arc::new(MemoryDatabase::new());
    let existing = TableRef::new("cdb_importer", "t1");
    db.create_table(
        &existing,
        vec![Column::text("id")],
        vec![vec![Some("42".to_string())]],
    )
    .unwrap();

    let collides = |_: &ToolInvocation, _: Option<Duration>| -> Invoked {
        Ok(ToolOutput {
            exit_code: Some(1),
            stderr: "ERROR 1: Layer t1 already exists".into(),
            ..ok_output()
        })
    };
    let loader = Loader::new(
        db.clone(),
        GeometryLoader::new(Ogr2ogr::default(), Arc::new(collides)),
        Georeferencer::default(),
        NormalizeOptions::default(),
        work.path(),
    );
    let (job, log) = job("t1");

    let err = loader.run_path(&job, &path).unwrap_err();
    assert_eq!(err.stage(), Stage::Load);
    assert!(db.table_exists(&existing).unwrap());
    assert_eq!(db.row_count(&existing).unwrap(), 1);
    assert!(!log.contains("dropped partially loaded table"));
}
