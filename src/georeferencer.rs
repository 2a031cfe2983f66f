//! Post-load georeferencing.
//!
//! Inspects a freshly loaded table for columns that carry location, and makes sure the table
//! ends with a geometry column in the configured SRID. The stage walks a small state machine:
//!
//! ```text
//! Unreferenced -> CandidateColumnsDetected -> GeometryColumnCreated -> Referenced
//! Unreferenced -> CandidateColumnsDetected -> Referenced            (existing geometry)
//! Unreferenced -> NoCandidates -> UnreferencedFinal
//! ```
//!
//! Every state visited is kept in [`GeoreferenceOutcome::trail`].

use std::fmt;

use tracing::{debug, info};

use crate::database::{DatabaseError, GeometryEncoding, GeometrySource, SpatialDatabase};
use crate::error::{LoaderError, LoaderResult, Stage};
use crate::job::Job;
use crate::types::{Column, ColumnType, TableRef};

/// WGS84 longitude/latitude.
pub const DEFAULT_SRID: i32 = 4326;

/// Name of the geometry column the georeferencer creates.
pub const DEFAULT_GEOMETRY_COLUMN: &str = "the_geom";

// Names are compared after lowercasing and dropping non-alphanumerics.
const LATITUDE_NAMES: &[&str] = &[
    "latitude",
    "lat",
    "latitudedecimal",
    "latitud",
    "lati",
    "decimallatitude",
    "decimallat",
];
const LONGITUDE_NAMES: &[&str] = &[
    "longitude",
    "lon",
    "lng",
    "longitudedecimal",
    "longitud",
    "long",
    "decimallongitude",
    "decimallong",
];
const GEOMETRY_TEXT_NAMES: &[&str] = &["thegeom", "geom", "geometry", "wkt", "wkbgeometry", "geojson"];
const ADDRESS_NAMES: &[&str] = &["address", "direccion", "street", "streetaddress", "addr"];

const SAMPLE_SIZE: usize = 20;

/// Columns that can give the table a location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    /// A geometry column is already present.
    ExistingGeometry { column: String, srid: i32 },
    LatLon { latitude: String, longitude: String },
    /// Text holding WKT, hex WKB, or GeoJSON.
    GeometryText {
        column: String,
        encoding: Option<GeometryEncoding>,
    },
    /// Street addresses; detected but not geocoded here.
    Address { column: String },
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Candidate::ExistingGeometry { column, srid } => {
                write!(f, "geometry column '{column}' (srid {srid})")
            }
            Candidate::LatLon {
                latitude,
                longitude,
            } => write!(f, "latitude '{latitude}' / longitude '{longitude}'"),
            Candidate::GeometryText { column, encoding } => match encoding {
                Some(enc) => write!(f, "geometry text '{column}' ({enc:?})"),
                None => write!(f, "geometry text '{column}'"),
            },
            Candidate::Address { column } => write!(f, "address '{column}'"),
        }
    }
}

/// States of the georeferencing stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeoreferenceState {
    Unreferenced,
    CandidateColumnsDetected(Candidate),
    NoCandidates,
    GeometryColumnCreated { column: String },
    Referenced { column: String, srid: i32 },
    UnreferencedFinal,
}

/// Trail of states one georeferencing pass went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoreferenceOutcome {
    pub trail: Vec<GeoreferenceState>,
}

impl GeoreferenceOutcome {
    /// Terminal state.
    pub fn state(&self) -> &GeoreferenceState {
        self.trail
            .last()
            .unwrap_or(&GeoreferenceState::Unreferenced)
    }

    pub fn is_referenced(&self) -> bool {
        matches!(self.state(), GeoreferenceState::Referenced { .. })
    }

    /// Geometry column of a referenced table.
    pub fn geometry_column(&self) -> Option<&str> {
        match self.state() {
            GeoreferenceState::Referenced { column, .. } => Some(column),
            _ => None,
        }
    }
}

/// Detects location columns and materializes a geometry column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Georeferencer {
    geometry_column: String,
    srid: i32,
}

impl Default for Georeferencer {
    fn default() -> Self {
        Self::new(DEFAULT_GEOMETRY_COLUMN, DEFAULT_SRID)
    }
}

impl Georeferencer {
    pub fn new(geometry_column: impl Into<String>, srid: i32) -> Self {
        Self {
            geometry_column: geometry_column.into(),
            srid,
        }
    }

    pub fn srid(&self) -> i32 {
        self.srid
    }

    pub fn geometry_column(&self) -> &str {
        &self.geometry_column
    }

    /// Best candidate among `columns`.
    ///
    /// Priority: an existing geometry column, then a latitude/longitude pair, then geometry
    /// text, then an address column. Within one kind, earlier names in the heuristic lists win,
    /// then earlier columns.
    pub fn detect(&self, columns: &[Column]) -> Option<Candidate> {
        let geometries: Vec<&Column> = columns
            .iter()
            .filter(|c| matches!(c.column_type, ColumnType::Geometry { .. }))
            .collect();
        let existing = geometries
            .iter()
            .find(|c| c.name == self.geometry_column)
            .or_else(|| geometries.first());
        if let Some(col) = existing {
            return Some(Candidate::ExistingGeometry {
                column: col.name.clone(),
                srid: col.geometry_srid().unwrap_or(0),
            });
        }

        let text: Vec<&Column> = columns
            .iter()
            .filter(|c| !matches!(c.column_type, ColumnType::Geometry { .. }))
            .collect();
        let latitude = find_named(&text, LATITUDE_NAMES);
        let longitude = find_named(&text, LONGITUDE_NAMES);
        if let (Some(latitude), Some(longitude)) = (latitude, longitude) {
            if latitude != longitude {
                return Some(Candidate::LatLon {
                    latitude: latitude.to_string(),
                    longitude: longitude.to_string(),
                });
            }
        }
        if let Some(column) = find_named(&text, GEOMETRY_TEXT_NAMES) {
            return Some(Candidate::GeometryText {
                column: column.to_string(),
                encoding: None,
            });
        }
        find_named(&text, ADDRESS_NAMES).map(|column| Candidate::Address {
            column: column.to_string(),
        })
    }

    /// Georeference the job's table in `db`.
    ///
    /// Running it twice is harmless: the second pass finds the geometry column the first one
    /// created and stops at `Referenced`.
    pub fn run(&self, job: &Job, db: &dyn SpatialDatabase) -> LoaderResult<GeoreferenceOutcome> {
        let table = job.table();
        let database = |source: DatabaseError| LoaderError::Database {
            stage: Stage::Georeference,
            table: table.clone(),
            source,
        };

        let mut trail = vec![GeoreferenceState::Unreferenced];
        let columns = db.columns(&table).map_err(database)?;

        let (candidate, source) = match self.detect(&columns) {
            None => {
                job.log(format!("georeference: no location columns in {table}"));
                trail.push(GeoreferenceState::NoCandidates);
                trail.push(GeoreferenceState::UnreferencedFinal);
                return Ok(GeoreferenceOutcome { trail });
            }
            Some(Candidate::Address { column }) => {
                job.log(format!(
                    "georeference: address column '{column}' detected in {table}; geocoding is not available, leaving table unreferenced"
                ));
                trail.push(GeoreferenceState::NoCandidates);
                trail.push(GeoreferenceState::UnreferencedFinal);
                return Ok(GeoreferenceOutcome { trail });
            }
            Some(candidate @ Candidate::ExistingGeometry { .. }) => {
                job.log(format!("georeference: detected {candidate}"));
                trail.push(GeoreferenceState::CandidateColumnsDetected(candidate.clone()));
                if let Candidate::ExistingGeometry { column, srid } = candidate {
                    let srid = if srid != 0 {
                        srid
                    } else {
                        db.set_srid(&table, &column, self.srid).map_err(database)?;
                        job.log(format!(
                            "georeference: assigned srid {} to '{column}'",
                            self.srid
                        ));
                        self.srid
                    };
                    trail.push(GeoreferenceState::Referenced { column, srid });
                }
                return Ok(GeoreferenceOutcome { trail });
            }
            Some(Candidate::LatLon {
                latitude,
                longitude,
            }) => (
                Candidate::LatLon {
                    latitude: latitude.clone(),
                    longitude: longitude.clone(),
                },
                GeometrySource::LatLon {
                    latitude,
                    longitude,
                },
            ),
            Some(Candidate::GeometryText { column, .. }) => {
                let samples = db
                    .sample_values(&table, &column, SAMPLE_SIZE)
                    .map_err(database)?;
                let encoding = infer_encoding(&samples);
                (
                    Candidate::GeometryText {
                        column: column.clone(),
                        encoding: Some(encoding),
                    },
                    GeometrySource::Text { column, encoding },
                )
            }
        };

        job.log(format!("georeference: detected {candidate}"));
        debug!(table = %table, candidate = %candidate, "georeference candidate");
        trail.push(GeoreferenceState::CandidateColumnsDetected(candidate));

        let column = self.new_column_name(&columns);
        let written = db
            .add_geometry_column(&table, &column, &source, self.srid)
            .map_err(|e| georeferencing_failure(&table, e))?;
        job.log(format!(
            "georeference: created geometry column '{column}' ({written} geometries, srid {})",
            self.srid
        ));
        trail.push(GeoreferenceState::GeometryColumnCreated {
            column: column.clone(),
        });

        info!(table = %table, column = %column, srid = self.srid, geometries = written, "table georeferenced");
        trail.push(GeoreferenceState::Referenced {
            column,
            srid: self.srid,
        });
        Ok(GeoreferenceOutcome { trail })
    }

    // The configured name, or the first free `<name>_N`.
    fn new_column_name(&self, columns: &[Column]) -> String {
        let taken = |name: &str| columns.iter().any(|c| c.name == name);
        if !taken(&self.geometry_column) {
            return self.geometry_column.clone();
        }
        (1..)
            .map(|n| format!("{}_{n}", self.geometry_column))
            .find(|name| !taken(name))
            .unwrap_or_else(|| self.geometry_column.clone())
    }
}

fn georeferencing_failure(table: &TableRef, e: DatabaseError) -> LoaderError {
    match e {
        DatabaseError::InvalidGeometry {
            column,
            row,
            value,
            message,
        } => {
            let mut detail = String::new();
            if let Some(row) = row {
                detail.push_str(&format!("row {row}: "));
            }
            if let Some(value) = value {
                detail.push_str(&format!("value '{value}': "));
            }
            detail.push_str(&message);
            LoaderError::GeoreferencingFailure {
                table: table.clone(),
                column,
                message: detail,
            }
        }
        other => LoaderError::Database {
            stage: Stage::Georeference,
            table: table.clone(),
            source: other,
        },
    }
}

fn normalized_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn find_named<'a>(columns: &[&'a Column], names: &[&str]) -> Option<&'a str> {
    let normalized: Vec<String> = columns.iter().map(|c| normalized_name(&c.name)).collect();
    names.iter().find_map(|wanted| {
        normalized
            .iter()
            .position(|n| n == wanted)
            .map(|idx| columns[idx].name.as_str())
    })
}

/// Guess how geometry text is encoded from non-blank samples.
pub fn infer_encoding(samples: &[String]) -> GeometryEncoding {
    let Some(first) = samples.iter().map(|s| s.trim()).find(|s| !s.is_empty()) else {
        return GeometryEncoding::Wkt;
    };
    if first.starts_with('{') {
        GeometryEncoding::GeoJson
    } else if first.len() % 2 == 0 && first.bytes().all(|b| b.is_ascii_hexdigit()) {
        GeometryEncoding::WkbHex
    } else {
        GeometryEncoding::Wkt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<Column> {
        names.iter().map(|n| Column::text(*n)).collect()
    }

    #[test]
    fn lat_lon_detected_case_insensitively() {
        let g = Georeferencer::default();
        assert_eq!(
            g.detect(&cols(&["Name", "LATITUDE", "Long"])),
            Some(Candidate::LatLon {
                latitude: "LATITUDE".into(),
                longitude: "Long".into()
            })
        );
        assert_eq!(
            g.detect(&cols(&["decimal_latitude", "decimal-longitude"])),
            Some(Candidate::LatLon {
                latitude: "decimal_latitude".into(),
                longitude: "decimal-longitude".into()
            })
        );
    }

    #[test]
    fn lat_lon_wins_over_geometry_text_and_address() {
        let g = Georeferencer::default();
        let c = g.detect(&cols(&["wkt", "address", "lat", "lng"])).unwrap();
        assert!(matches!(c, Candidate::LatLon { .. }));
        let c = g.detect(&cols(&["address", "WKT"])).unwrap();
        assert_eq!(
            c,
            Candidate::GeometryText {
                column: "WKT".into(),
                encoding: None
            }
        );
        let c = g.detect(&cols(&["name", "Street Address"])).unwrap();
        assert_eq!(c, Candidate::Address { column: "Street Address".into() });
        assert_eq!(g.detect(&cols(&["name", "lat"])), None);
    }

    #[test]
    fn existing_geometry_takes_precedence() {
        let g = Georeferencer::default();
        let mut columns = cols(&["lat", "lon"]);
        columns.push(Column::new("wkb_geometry", ColumnType::Geometry { srid: 0 }));
        assert_eq!(
            g.detect(&columns),
            Some(Candidate::ExistingGeometry {
                column: "wkb_geometry".into(),
                srid: 0
            })
        );
    }

    #[test]
    fn encoding_is_inferred_from_samples() {
        assert_eq!(
            infer_encoding(&["{\"type\":\"Point\"}".into()]),
            GeometryEncoding::GeoJson
        );
        assert_eq!(
            infer_encoding(&["0101000000000000000000F03F0000000000000040".into()]),
            GeometryEncoding::WkbHex
        );
        assert_eq!(infer_encoding(&["POINT(1 2)".into()]), GeometryEncoding::Wkt);
        assert_eq!(infer_encoding(&[]), GeometryEncoding::Wkt);
    }

    #[test]
    fn taken_geometry_name_gets_a_suffix() {
        let g = Georeferencer::default();
        assert_eq!(g.new_column_name(&cols(&["a"])), "the_geom");
        assert_eq!(g.new_column_name(&cols(&["the_geom", "the_geom_1"])), "the_geom_2");
    }
}
