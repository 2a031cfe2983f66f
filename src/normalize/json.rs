//! JSON-to-CSV flattening.
//!
//! Supported inputs:
//! - A JSON array of objects: `[{"a":1}, {"a":2}]`
//! - A single object: `{"a":1}`
//! - Newline-delimited JSON (NDJSON): `{"a":1}\n{"a":2}\n`
//!
//! Columns are the union of keys in first-seen order. Records must be flat: a nested object or
//! array cannot be flattened unambiguously and is an error. GeoJSON documents are left for the
//! geometry tool to read natively.

use std::collections::HashMap;
use std::fs;

use serde_json::Value;
use tracing::debug;

use crate::error::NormalizeFailure;
use crate::types::{NormalizerResult, SourceFile};

use super::{converted_result, write_canonical, Normalizer, Scratch};

/// A parsed JSON upload.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonDocument {
    /// A GeoJSON `FeatureCollection` or `Feature`.
    GeoJson,
    /// Plain records.
    Records(Vec<Value>),
}

/// Flattened records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Flatten a JSON upload into canonical CSV inside `scratch`.
///
/// GeoJSON input is passed through unchanged (`converted == false`).
pub fn flatten_json(
    source: &SourceFile,
    scratch: &mut Scratch,
) -> Result<NormalizerResult, NormalizeFailure> {
    let text = fs::read_to_string(source.path())?;
    let values = match parse_document(&text)? {
        JsonDocument::GeoJson => {
            debug!(path = %source.path().display(), "geojson detected; not flattening");
            return Ok(NormalizerResult {
                normalizer: Normalizer::SemiStructured,
                file: source.clone(),
                converted: false,
            });
        }
        JsonDocument::Records(values) => values,
    };

    let table = flatten_records(&values)?;
    let out = scratch.create(&source.stem(), "csv")?;
    write_canonical(&out, &table.header, &table.rows)?;

    debug!(
        path = %source.path().display(),
        columns = table.header.len(),
        rows = table.rows.len(),
        "flattened json records"
    );

    converted_result(Normalizer::SemiStructured, &out)
}

/// Parse an upload as a JSON document, falling back to NDJSON.
pub fn parse_document(input: &str) -> Result<JsonDocument, NormalizeFailure> {
    let trimmed = input.trim_start_matches('\u{feff}').trim();
    if trimmed.is_empty() {
        return Err(NormalizeFailure::EmptyFile);
    }

    // First try parsing as a single JSON value (array or object).
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Array(items)) => Ok(JsonDocument::Records(items)),
        Ok(v @ Value::Object(_)) => {
            if is_geojson(&v) {
                Ok(JsonDocument::GeoJson)
            } else {
                Ok(JsonDocument::Records(vec![v]))
            }
        }
        Ok(_) => Err(NormalizeFailure::NotARecord { record: 1 }),
        // A malformed array is not NDJSON; report the document error.
        Err(e) if trimmed.starts_with('[') => Err(NormalizeFailure::Json(e)),
        Err(_) => {
            let mut values = Vec::new();
            for (i, line) in trimmed.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let v = serde_json::from_str::<Value>(line).map_err(|source| {
                    NormalizeFailure::InvalidNdjson {
                        line: i + 1,
                        source,
                    }
                })?;
                values.push(v);
            }
            Ok(JsonDocument::Records(values))
        }
    }
}

fn is_geojson(v: &Value) -> bool {
    matches!(
        v.get("type").and_then(Value::as_str),
        Some("FeatureCollection") | Some("Feature")
    )
}

/// Flatten records into rows over the union of their keys, in first-seen order.
pub fn flatten_records(values: &[Value]) -> Result<FlatTable, NormalizeFailure> {
    if values.is_empty() {
        return Err(NormalizeFailure::NoRecords);
    }

    let mut header: Vec<String> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for (idx0, v) in values.iter().enumerate() {
        let record = idx0 + 1;
        let obj = v
            .as_object()
            .ok_or(NormalizeFailure::NotARecord { record })?;
        for (key, value) in obj {
            if let Some(kind) = nested_kind(value) {
                return Err(NormalizeFailure::NestedValue {
                    record,
                    key: key.clone(),
                    kind,
                });
            }
            if !positions.contains_key(key) {
                positions.insert(key.clone(), header.len());
                header.push(key.clone());
            }
        }
    }
    if header.is_empty() {
        return Err(NormalizeFailure::MissingHeader);
    }

    let mut rows: Vec<Vec<String>> = Vec::with_capacity(values.len());
    for v in values {
        let mut row = vec![String::new(); header.len()];
        if let Some(obj) = v.as_object() {
            for (key, value) in obj {
                if let Some(&pos) = positions.get(key) {
                    row[pos] = scalar_to_text(value);
                }
            }
        }
        rows.push(row);
    }

    Ok(FlatTable { header, rows })
}

fn nested_kind(v: &Value) -> Option<&'static str> {
    match v {
        Value::Object(_) => Some("object"),
        Value::Array(_) => Some("array"),
        _ => None,
    }
}

fn scalar_to_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Rejected before rows are built.
        Value::Array(_) | Value::Object(_) => v.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn union_of_keys_in_first_seen_order() {
        let values = vec![json!({"a": 1, "b": 2}), json!({"a": 3})];
        let t = flatten_records(&values).unwrap();
        assert_eq!(t.header, vec!["a", "b"]);
        assert_eq!(t.rows, vec![vec!["1", "2"], vec!["3", ""]]);
    }

    #[test]
    fn later_keys_append_columns_without_mismatch() {
        let values = vec![
            json!({"name": "x", "lat": 1.5}),
            json!({"lon": -3, "name": "y", "ok": true, "n": null}),
        ];
        let t = flatten_records(&values).unwrap();
        assert_eq!(t.header, vec!["name", "lat", "lon", "ok", "n"]);
        assert!(t.rows.iter().all(|r| r.len() == 5));
        assert_eq!(t.rows[1], vec!["y", "", "-3", "true", ""]);
    }

    #[test]
    fn nested_values_are_rejected() {
        let err = flatten_records(&[json!({"a": 1}), json!({"a": {"b": 2}})]).unwrap_err();
        assert!(matches!(
            err,
            NormalizeFailure::NestedValue { record: 2, kind: "object", .. }
        ));
        let err = flatten_records(&[json!({"tags": [1, 2]})]).unwrap_err();
        assert!(matches!(err, NormalizeFailure::NestedValue { kind: "array", .. }));
    }

    #[test]
    fn heterogeneous_elements_are_rejected() {
        let err = flatten_records(&[json!({"a": 1}), json!(5)]).unwrap_err();
        assert!(matches!(err, NormalizeFailure::NotARecord { record: 2 }));
    }

    #[test]
    fn ndjson_and_geojson_are_recognized() {
        let doc = parse_document("{\"a\":1}\n\n{\"a\":2}\n").unwrap();
        assert_eq!(
            doc,
            JsonDocument::Records(vec![json!({"a": 1}), json!({"a": 2})])
        );
        let doc = parse_document(r#"{"type":"FeatureCollection","features":[]}"#).unwrap();
        assert_eq!(doc, JsonDocument::GeoJson);
    }

    #[test]
    fn malformed_input_reports_position() {
        let err = parse_document("{\"a\":1}\n{oops}\n").unwrap_err();
        assert!(matches!(err, NormalizeFailure::InvalidNdjson { line: 2, .. }));
        let err = parse_document("[{\"a\":1},").unwrap_err();
        assert!(matches!(err, NormalizeFailure::Json(_)));
        assert!(matches!(parse_document("[]"), Ok(JsonDocument::Records(v)) if v.is_empty()));
        assert!(matches!(flatten_records(&[]), Err(NormalizeFailure::NoRecords)));
    }
}
