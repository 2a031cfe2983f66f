//! In-process [`SpatialDatabase`].
//!
//! Tables are rows of optional text cells; geometry cells hold EWKT-style text
//! (`SRID=4326;POINT(lon lat)`). Geometry text is checked structurally, not parsed into
//! coordinates, which is enough to tell well-formed input from garbage.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{DatabaseError, GeometryEncoding, GeometrySource, SpatialDatabase};
use crate::types::{Column, ColumnType, TableRef};

/// Rows and columns of one in-memory table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemoryTable {
    pub columns: Vec<Column>,
    /// Row-major cells; `None` is SQL NULL.
    pub rows: Vec<Vec<Option<String>>>,
}

impl MemoryTable {
    fn position(&self, table: &TableRef, column: &str) -> Result<usize, DatabaseError> {
        self.columns
            .iter()
            .position(|c| c.name == column)
            .ok_or_else(|| DatabaseError::MissingColumn {
                table: table.clone(),
                column: column.to_string(),
            })
    }

    /// Cells of `column`, in row order.
    pub fn column_values(&self, column: &str) -> Option<Vec<Option<&str>>> {
        let idx = self.columns.iter().position(|c| c.name == column)?;
        Some(
            self.rows
                .iter()
                .map(|r| r.get(idx).and_then(|c| c.as_deref()))
                .collect(),
        )
    }
}

/// Thread-safe map of in-memory tables.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    tables: Mutex<BTreeMap<TableRef, MemoryTable>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<TableRef, MemoryTable>>, DatabaseError> {
        self.tables
            .lock()
            .map_err(|_| DatabaseError::Backend("memory database lock poisoned".to_string()))
    }

    /// Create `table`; fails if it already exists.
    pub fn create_table(
        &self,
        table: &TableRef,
        columns: Vec<Column>,
        rows: Vec<Vec<Option<String>>>,
    ) -> Result<(), DatabaseError> {
        let mut tables = self.lock()?;
        if tables.contains_key(table) {
            return Err(DatabaseError::TableExists(table.clone()));
        }
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut r| {
                r.resize(width, None);
                r
            })
            .collect();
        tables.insert(table.clone(), MemoryTable { columns, rows });
        Ok(())
    }

    /// Load a canonical CSV into a new table of text columns, the way ogr2ogr's CSV driver
    /// does without type detection. Blank cells become NULL. Returns the row count.
    pub fn load_csv(&self, table: &TableRef, path: &Path) -> Result<u64, DatabaseError> {
        let backend = |e: csv::Error| DatabaseError::Backend(e.to_string());
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(backend)?;
        let columns: Vec<Column> = rdr.headers().map_err(backend)?.iter().map(Column::text).collect();
        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record.map_err(backend)?;
            rows.push(
                record
                    .iter()
                    .map(|c| (!c.is_empty()).then(|| c.to_string()))
                    .collect::<Vec<_>>(),
            );
        }
        let count = rows.len() as u64;
        self.create_table(table, columns, rows)?;
        Ok(count)
    }

    /// Snapshot of `table`.
    pub fn table(&self, table: &TableRef) -> Option<MemoryTable> {
        self.lock().ok()?.get(table).cloned()
    }

    /// All table identities, sorted.
    pub fn table_names(&self) -> Vec<TableRef> {
        self.lock()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl SpatialDatabase for MemoryDatabase {
    fn table_exists(&self, table: &TableRef) -> Result<bool, DatabaseError> {
        Ok(self.lock()?.contains_key(table))
    }

    fn row_count(&self, table: &TableRef) -> Result<u64, DatabaseError> {
        let tables = self.lock()?;
        let t = tables
            .get(table)
            .ok_or_else(|| DatabaseError::MissingTable(table.clone()))?;
        Ok(t.rows.len() as u64)
    }

    fn columns(&self, table: &TableRef) -> Result<Vec<Column>, DatabaseError> {
        let tables = self.lock()?;
        let t = tables
            .get(table)
            .ok_or_else(|| DatabaseError::MissingTable(table.clone()))?;
        Ok(t.columns.clone())
    }

    fn sample_values(
        &self,
        table: &TableRef,
        column: &str,
        limit: usize,
    ) -> Result<Vec<String>, DatabaseError> {
        let tables = self.lock()?;
        let t = tables
            .get(table)
            .ok_or_else(|| DatabaseError::MissingTable(table.clone()))?;
        let idx = t.position(table, column)?;
        Ok(t.rows
            .iter()
            .filter_map(|r| r.get(idx).and_then(|c| c.as_deref()))
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .take(limit)
            .map(str::to_owned)
            .collect())
    }

    fn add_geometry_column(
        &self,
        table: &TableRef,
        column: &str,
        source: &GeometrySource,
        srid: i32,
    ) -> Result<u64, DatabaseError> {
        let mut tables = self.lock()?;
        let t = tables
            .get_mut(table)
            .ok_or_else(|| DatabaseError::MissingTable(table.clone()))?;
        if t.columns.iter().any(|c| c.name == column) {
            return Err(DatabaseError::DuplicateColumn {
                table: table.clone(),
                column: column.to_string(),
            });
        }

        // Compute every value before touching the table so a bad row leaves it unchanged.
        let values: Vec<Option<String>> = match source {
            GeometrySource::LatLon {
                latitude,
                longitude,
            } => {
                let lat_idx = t.position(table, latitude)?;
                let lon_idx = t.position(table, longitude)?;
                t.rows
                    .iter()
                    .enumerate()
                    .map(|(i, row)| {
                        let row_num = i as u64 + 1;
                        let lat = cell(row, lat_idx);
                        let lon = cell(row, lon_idx);
                        match (lat, lon) {
                            (Some(lat), Some(lon)) => {
                                let lat = coordinate(latitude, row_num, lat, 90.0)?;
                                let lon = coordinate(longitude, row_num, lon, 180.0)?;
                                Ok(Some(format!("SRID={srid};POINT({lon} {lat})")))
                            }
                            _ => Ok(None),
                        }
                    })
                    .collect::<Result<_, DatabaseError>>()?
            }
            GeometrySource::Text {
                column: src,
                encoding,
            } => {
                let idx = t.position(table, src)?;
                t.rows
                    .iter()
                    .enumerate()
                    .map(|(i, row)| match cell(row, idx) {
                        Some(text) => {
                            check_geometry_text(text, *encoding).map_err(|message| {
                                DatabaseError::InvalidGeometry {
                                    column: src.clone(),
                                    row: Some(i as u64 + 1),
                                    value: Some(text.to_string()),
                                    message,
                                }
                            })?;
                            Ok(Some(format!("SRID={srid};{}", strip_srid(text))))
                        }
                        None => Ok(None),
                    })
                    .collect::<Result<_, DatabaseError>>()?
            }
        };

        let written = values.iter().filter(|v| v.is_some()).count() as u64;
        t.columns
            .push(Column::new(column, ColumnType::Geometry { srid }));
        for (row, value) in t.rows.iter_mut().zip(values) {
            row.push(value);
        }
        Ok(written)
    }

    fn set_srid(&self, table: &TableRef, column: &str, srid: i32) -> Result<(), DatabaseError> {
        let mut tables = self.lock()?;
        let t = tables
            .get_mut(table)
            .ok_or_else(|| DatabaseError::MissingTable(table.clone()))?;
        let idx = t.position(table, column)?;
        match t.columns[idx].column_type {
            ColumnType::Geometry { .. } => {
                t.columns[idx].column_type = ColumnType::Geometry { srid };
            }
            _ => {
                return Err(DatabaseError::Backend(format!(
                    "column '{column}' of {table} is not a geometry column"
                )));
            }
        }
        for row in &mut t.rows {
            if let Some(Some(value)) = row.get_mut(idx) {
                *value = format!("SRID={srid};{}", strip_srid(value));
            }
        }
        Ok(())
    }

    fn drop_table(&self, table: &TableRef) -> Result<(), DatabaseError> {
        self.lock()?.remove(table);
        Ok(())
    }
}

fn cell(row: &[Option<String>], idx: usize) -> Option<&str> {
    row.get(idx)
        .and_then(|c| c.as_deref())
        .map(str::trim)
        .filter(|c| !c.is_empty())
}

fn coordinate(column: &str, row: u64, raw: &str, limit: f64) -> Result<f64, DatabaseError> {
    let invalid = |message: String| DatabaseError::InvalidGeometry {
        column: column.to_string(),
        row: Some(row),
        value: Some(raw.to_string()),
        message,
    };
    let v: f64 = raw
        .parse()
        .map_err(|_| invalid(format!("'{raw}' is not a number")))?;
    if !v.is_finite() || v.abs() > limit {
        return Err(invalid(format!("{v} is outside [-{limit}, {limit}]")));
    }
    Ok(v)
}

fn strip_srid(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.len() > 5
        && trimmed
            .get(..5)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("SRID="))
    {
        if let Some(pos) = trimmed.find(';') {
            return trimmed[pos + 1..].trim_start();
        }
    }
    trimmed
}

const WKT_TYPES: [&str; 7] = [
    "GEOMETRYCOLLECTION",
    "MULTIPOLYGON",
    "MULTILINESTRING",
    "MULTIPOINT",
    "POLYGON",
    "LINESTRING",
    "POINT",
];

fn check_geometry_text(text: &str, encoding: GeometryEncoding) -> Result<(), String> {
    match encoding {
        GeometryEncoding::Wkt => check_wkt(strip_srid(text)),
        GeometryEncoding::WkbHex => check_wkb_hex(text),
        GeometryEncoding::GeoJson => check_geojson(text),
    }
}

fn check_wkt(text: &str) -> Result<(), String> {
    let upper = text.to_ascii_uppercase();
    let kind = WKT_TYPES
        .iter()
        .find(|k| upper.starts_with(**k))
        .ok_or_else(|| format!("'{text}' is not well-known text"))?;
    let mut rest = upper[kind.len()..].trim_start();
    for modifier in ["ZM", "Z", "M"] {
        if let Some(r) = rest.strip_prefix(modifier) {
            if r.starts_with([' ', '(']) {
                rest = r.trim_start();
                break;
            }
        }
    }
    if rest == "EMPTY" {
        return Ok(());
    }
    if !rest.starts_with('(') || !rest.ends_with(')') {
        return Err(format!("'{text}' has no coordinate list"));
    }

    let mut depth = 0i32;
    for c in rest.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(format!("'{text}' has unbalanced parentheses"));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(format!("'{text}' has unbalanced parentheses"));
    }

    if *kind != "GEOMETRYCOLLECTION" {
        let numeric = rest
            .split(|c: char| c == '(' || c == ')' || c == ',' || c.is_whitespace())
            .filter(|tok| !tok.is_empty() && *tok != "EMPTY");
        let mut any = false;
        for tok in numeric {
            tok.parse::<f64>()
                .map_err(|_| format!("'{tok}' is not a coordinate in '{text}'"))?;
            any = true;
        }
        if !any {
            return Err(format!("'{text}' has no coordinates"));
        }
    }
    Ok(())
}

fn check_wkb_hex(text: &str) -> Result<(), String> {
    let t = text.trim();
    // Byte order + geometry type + at least one coordinate pair.
    if t.len() < 42 || t.len() % 2 != 0 || !t.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(format!("'{t}' is not hex-encoded WKB"));
    }
    if !(t.starts_with("00") || t.starts_with("01")) {
        return Err(format!("'{t}' has no WKB byte-order marker"));
    }
    Ok(())
}

fn check_geojson(text: &str) -> Result<(), String> {
    let v: serde_json::Value =
        serde_json::from_str(text).map_err(|e| format!("invalid GeoJSON: {e}"))?;
    let kind = v
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| "GeoJSON geometry has no type".to_string())?;
    let has_body = v.get("coordinates").is_some() || v.get("geometries").is_some();
    if !has_body {
        return Err(format!("GeoJSON {kind} has no coordinates"));
    }
    Ok(())
}
