use std::fs;
use std::sync::Arc;
use std::time::Duration;

use geo_ingest::batch::{expand_inputs, plan_tables, BatchRunner};
use geo_ingest::database::memory::MemoryDatabase;
use geo_ingest::database::SpatialDatabase;
use geo_ingest::geometry_loader::{GeometryLoader, InvokeError, Ogr2ogr, ToolInvocation, ToolOutput};
use geo_ingest::georeferencer::Georeferencer;
use geo_ingest::job::{ConnectionParams, Job};
use geo_ingest::loader::Loader;
use geo_ingest::normalize::NormalizeOptions;
use geo_ingest::observability::MemoryJobLog;
use geo_ingest::types::TableRef;
use geo_ingest::LoaderError;

fn loader(db: Arc<MemoryDatabase>, work: &std::path::Path) -> Arc<Loader> {
    let sink = db.clone();
    let invoker = move |inv: &ToolInvocation,
                        _: Option<Duration>|
          -> Result<ToolOutput, InvokeError> {
        let (schema, name) = inv.layer.split_once('.').unwrap();
        sink.load_csv(&TableRef::new(schema, name), &inv.source)
            .unwrap();
        Ok(ToolOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::from_millis(1),
        })
    };
    Arc::new(Loader::new(
        db,
        GeometryLoader::new(Ogr2ogr::default(), Arc::new(invoker)),
        Georeferencer::default(),
        NormalizeOptions::default(),
        work,
    ))
}

#[test]
fn batch_loads_every_file_into_its_own_table() {
    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let sub = dir.path().join("more");
    fs::create_dir(&sub).unwrap();
    fs::write(dir.path().join("points.csv"), "name,lat,lon\nA,1,2\n").unwrap();
    fs::write(sub.join("points.csv"), "name,lat,lon\nB,3,4\nC,5,6\n").unwrap();
    fs::write(dir.path().join("broken.csv"), "").unwrap();
    fs::write(
        dir.path().join("rows.json"),
        r#"[{"name":"D","lat":7,"lon":8}]"#,
    )
    .unwrap();

    let inputs = expand_inputs(&[
        dir.path().join("points.csv").display().to_string(),
        dir.path().join("broken.csv").display().to_string(),
        format!("{}/*.csv", sub.display()),
        dir.path().join("rows.json").display().to_string(),
    ])
    .unwrap();
    let items = plan_tables(&inputs, None);
    let names: Vec<&str> = items.iter().map(|i| i.table_name.as_str()).collect();
    assert_eq!(names, vec!["points", "broken", "points_1", "rows"]);

    let db = Arc::new(MemoryDatabase::new());
    let runner = BatchRunner::new(loader(db.clone(), work.path()), 2).unwrap();
    assert_eq!(runner.max_parallel_runs(), 2);

    let outcomes = runner.run(items.clone(), |item| {
        let conn = ConnectionParams::new("localhost", 5432, "carto", "importer");
        Job::new(&item.table_name, conn, Arc::new(MemoryJobLog::default()))
    });

    // One outcome per item, in input order.
    let order: Vec<_> = outcomes.iter().map(|o| o.item.clone()).collect();
    assert_eq!(order, items);

    let rows: Vec<Option<u64>> = outcomes
        .iter()
        .map(|o| o.result.as_ref().ok().map(|t| t.rows))
        .collect();
    assert_eq!(rows, vec![Some(1), None, Some(2), Some(1)]);
    assert!(matches!(
        outcomes[1].result,
        Err(LoaderError::NormalizationFailure { .. })
    ));

    for name in ["points", "points_1", "rows"] {
        let table = TableRef::new("cdb_importer", name);
        assert!(db.table_exists(&table).unwrap(), "{name} missing");
    }
    assert!(!db
        .table_exists(&TableRef::new("cdb_importer", "broken"))
        .unwrap());
    assert!(outcomes
        .iter()
        .filter_map(|o| o.result.as_ref().ok())
        .all(|t| t.georeference.is_referenced()));
}

#[test]
fn zero_parallelism_still_runs() {
    let work = tempfile::tempdir().unwrap();
    let db = Arc::new(MemoryDatabase::new());
    let runner = BatchRunner::new(loader(db, work.path()), 0).unwrap();
    assert_eq!(runner.max_parallel_runs(), 1);
    assert!(runner
        .run(Vec::new(), |_| unreachable!("no items"))
        .is_empty());
}
