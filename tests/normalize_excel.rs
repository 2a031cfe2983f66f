#![cfg(feature = "excel")]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rust_xlsxwriter::Workbook;

use geo_ingest::job::{ConnectionParams, Job};
use geo_ingest::normalize::excel::read_sheet;
use geo_ingest::normalize::{run_chain, NormalizeOptions, Normalizer, Scratch, SheetSelection};
use geo_ingest::observability::MemoryJobLog;
use geo_ingest::types::SourceFile;
use geo_ingest::{LoaderError, NormalizeFailure};

fn job() -> Job {
    let conn = ConnectionParams::new("localhost", 5432, "carto", "importer");
    Job::new("t1", conn, Arc::new(MemoryJobLog::default()))
}

fn write_three_sheets(path: &Path) {
    let mut wb = Workbook::new();

    let ws = wb.add_worksheet();
    ws.set_name("Points").unwrap();
    // Header on the third row; the blank rows above it are skipped.
    ws.write_string(2, 0, "name").unwrap();
    ws.write_string(2, 1, "lat").unwrap();
    ws.write_string(2, 2, "lon").unwrap();
    ws.write_string(2, 4, "visits").unwrap();
    ws.write_string(3, 0, "Sol").unwrap();
    ws.write_number(3, 1, 40.416775).unwrap();
    ws.write_number(3, 2, -3.70379).unwrap();
    ws.write_number(3, 4, 12.0).unwrap();
    ws.write_string(5, 0, "Retiro").unwrap();
    ws.write_number(5, 1, 40.4153).unwrap();
    ws.write_number(5, 2, -3.6845).unwrap();
    ws.write_boolean(5, 4, true).unwrap();

    let ws = wb.add_worksheet();
    ws.set_name("Lookup").unwrap();
    ws.write_string(0, 0, "code").unwrap();
    ws.write_number(1, 0, 7.0).unwrap();

    let ws = wb.add_worksheet();
    ws.set_name("Notes").unwrap();
    ws.write_string(0, 0, "note").unwrap();
    ws.write_string(1, 0, "hello, world").unwrap();

    wb.save(path).unwrap();
}

fn normalize(path: &Path, options: &NormalizeOptions, work: &Path) -> Result<String, LoaderError> {
    let source = SourceFile::new(path).unwrap();
    let mut scratch = Scratch::new(work);
    let out = run_chain(&source, options, &mut scratch, &job())?;
    assert_eq!(out.normalizers(), vec![Normalizer::Spreadsheet]);
    Ok(fs::read_to_string(out.file.path()).unwrap())
}

fn fixture(dir: &Path) -> PathBuf {
    let path = dir.join("madrid.xlsx");
    write_three_sheets(&path);
    path
}

#[test]
fn first_sheet_is_converted_with_displayed_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(dir.path());
    let csv = normalize(&path, &NormalizeOptions::default(), dir.path()).unwrap();
    assert_eq!(
        csv,
        "name,lat,lon,field_4,visits\nSol,40.416775,-3.70379,,12\nRetiro,40.4153,-3.6845,,true\n"
    );
}

#[test]
fn sheet_choice_is_stable_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(dir.path());
    let first = normalize(&path, &NormalizeOptions::default(), dir.path()).unwrap();
    let again = normalize(&path, &NormalizeOptions::default(), dir.path()).unwrap();
    assert_eq!(first, again);
}

#[test]
fn sheet_can_be_selected_by_name_or_index() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(dir.path());

    let by_name = NormalizeOptions {
        sheet: SheetSelection::Named("Lookup".into()),
        ..NormalizeOptions::default()
    };
    assert_eq!(normalize(&path, &by_name, dir.path()).unwrap(), "code\n7\n");

    let by_index = NormalizeOptions {
        sheet: SheetSelection::Index(2),
        ..NormalizeOptions::default()
    };
    assert_eq!(
        normalize(&path, &by_index, dir.path()).unwrap(),
        "note\n\"hello, world\"\n"
    );

    let table = read_sheet(&path, &SheetSelection::Index(1)).unwrap();
    assert_eq!(table.sheet, "Lookup");
}

#[test]
fn missing_sheet_is_a_normalization_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(dir.path());
    let options = NormalizeOptions {
        sheet: SheetSelection::Named("Nope".into()),
        ..NormalizeOptions::default()
    };
    let err = normalize(&path, &options, dir.path()).unwrap_err();
    assert!(matches!(
        err,
        LoaderError::NormalizationFailure {
            normalizer: Normalizer::Spreadsheet,
            cause: NormalizeFailure::SheetNotFound { .. },
            ..
        }
    ));
}

#[test]
fn corrupt_workbook_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.xlsx");
    fs::write(&path, b"this is not a zip archive").unwrap();
    let err = normalize(&path, &NormalizeOptions::default(), dir.path()).unwrap_err();
    assert!(matches!(
        err,
        LoaderError::NormalizationFailure {
            cause: NormalizeFailure::Excel(_),
            ..
        }
    ));
}
