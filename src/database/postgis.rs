//! PostgreSQL/PostGIS backend.
//!
//! The pipeline is synchronous, so the backend owns a small tokio runtime and blocks on each
//! query. Do not call it from inside another tokio runtime.

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tokio::runtime::Runtime;
use tracing::debug;

use super::{DatabaseError, GeometryEncoding, GeometrySource, SpatialDatabase};
use crate::job::ConnectionParams;
use crate::types::{Column, ColumnType, TableRef};

const NUMBER_PATTERN: &str = r"^[-+]?([0-9]+\.?[0-9]*|\.[0-9]+)([eE][-+]?[0-9]+)?$";

/// [`SpatialDatabase`] over a PostGIS-enabled PostgreSQL database.
pub struct PostgisDatabase {
    runtime: Runtime,
    pool: PgPool,
}

impl PostgisDatabase {
    /// Connect with `params`; the pool opens at most two connections.
    pub fn connect(params: &ConnectionParams) -> Result<Self, DatabaseError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| DatabaseError::Backend(format!("cannot start runtime: {e}")))?;

        let mut options = PgConnectOptions::new()
            .host(&params.host)
            .port(params.port)
            .username(&params.user)
            .database(&params.database);
        if let Some(password) = &params.password {
            options = options.password(password);
        }

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(2)
                    .acquire_timeout(Duration::from_secs(30))
                    .connect_with(options),
            )
            .map_err(backend)?;

        debug!(connection = %params.redacted(), "connected to postgis");
        Ok(Self { runtime, pool })
    }

    fn require_table(&self, table: &TableRef) -> Result<(), DatabaseError> {
        if self.table_exists(table)? {
            Ok(())
        } else {
            Err(DatabaseError::MissingTable(table.clone()))
        }
    }

    fn geometry_srid(&self, table: &TableRef, column: &str) -> Result<i32, DatabaseError> {
        let registered: Option<i32> = self
            .runtime
            .block_on(
                sqlx::query_scalar(
                    "SELECT srid FROM geometry_columns \
                     WHERE f_table_schema = $1 AND f_table_name = $2 AND f_geometry_column = $3",
                )
                .bind(&table.schema)
                .bind(&table.name)
                .bind(column)
                .fetch_optional(&self.pool),
            )
            .map_err(backend)?;
        if let Some(srid) = registered.filter(|s| *s != 0) {
            return Ok(srid);
        }

        // Unconstrained columns report 0; fall back to the data.
        let sql = format!(
            "SELECT ST_SRID({col}) FROM {t} WHERE {col} IS NOT NULL LIMIT 1",
            col = quote_ident(column),
            t = qualified(table)
        );
        let from_data: Option<i32> = self
            .runtime
            .block_on(sqlx::query_scalar(&sql).fetch_optional(&self.pool))
            .map_err(backend)?;
        Ok(from_data.unwrap_or(0))
    }

    fn check_lat_lon(
        &self,
        table: &TableRef,
        latitude: &str,
        longitude: &str,
    ) -> Result<(), DatabaseError> {
        let sql = format!(
            "SELECT n, la, lo FROM ( \
               SELECT row_number() OVER () AS n, btrim({lat}::text) AS la, btrim({lon}::text) AS lo \
               FROM {t}) s \
             WHERE la <> '' AND lo <> '' AND NOT CASE \
               WHEN la ~ $1 AND lo ~ $1 THEN abs(la::float8) <= 90 AND abs(lo::float8) <= 180 \
               ELSE false END \
             LIMIT 1",
            lat = quote_ident(latitude),
            lon = quote_ident(longitude),
            t = qualified(table)
        );
        let bad: Option<(i64, String, String)> = self
            .runtime
            .block_on(
                sqlx::query_as(&sql)
                    .bind(NUMBER_PATTERN)
                    .fetch_optional(&self.pool),
            )
            .map_err(backend)?;
        match bad {
            None => Ok(()),
            Some((row, lat, lon)) => Err(DatabaseError::InvalidGeometry {
                column: format!("{latitude}/{longitude}"),
                row: Some(row as u64),
                value: Some(format!("{lat}, {lon}")),
                message: "not a valid latitude/longitude pair".to_string(),
            }),
        }
    }
}

impl SpatialDatabase for PostgisDatabase {
    fn table_exists(&self, table: &TableRef) -> Result<bool, DatabaseError> {
        self.runtime
            .block_on(
                sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                     WHERE table_schema = $1 AND table_name = $2)",
                )
                .bind(&table.schema)
                .bind(&table.name)
                .fetch_one(&self.pool),
            )
            .map_err(backend)
    }

    fn row_count(&self, table: &TableRef) -> Result<u64, DatabaseError> {
        self.require_table(table)?;
        let sql = format!("SELECT count(*) FROM {}", qualified(table));
        let n: i64 = self
            .runtime
            .block_on(sqlx::query_scalar(&sql).fetch_one(&self.pool))
            .map_err(backend)?;
        Ok(n.max(0) as u64)
    }

    fn columns(&self, table: &TableRef) -> Result<Vec<Column>, DatabaseError> {
        self.require_table(table)?;
        let rows: Vec<(String, String)> = self
            .runtime
            .block_on(
                sqlx::query_as(
                    "SELECT column_name::text, udt_name::text FROM information_schema.columns \
                     WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
                )
                .bind(&table.schema)
                .bind(&table.name)
                .fetch_all(&self.pool),
            )
            .map_err(backend)?;

        rows.into_iter()
            .map(|(name, udt)| -> Result<Column, DatabaseError> {
                let column_type = match column_type_for(&udt) {
                    ColumnType::Geometry { .. } => ColumnType::Geometry {
                        srid: self.geometry_srid(table, &name)?,
                    },
                    other => other,
                };
                Ok(Column::new(name, column_type))
            })
            .collect()
    }

    fn sample_values(
        &self,
        table: &TableRef,
        column: &str,
        limit: usize,
    ) -> Result<Vec<String>, DatabaseError> {
        let sql = format!(
            "SELECT btrim({col}::text) FROM {t} \
             WHERE {col} IS NOT NULL AND btrim({col}::text) <> '' LIMIT $1",
            col = quote_ident(column),
            t = qualified(table)
        );
        self.runtime
            .block_on(
                sqlx::query_scalar(&sql)
                    .bind(limit as i64)
                    .fetch_all(&self.pool),
            )
            .map_err(backend)
    }

    fn add_geometry_column(
        &self,
        table: &TableRef,
        column: &str,
        source: &GeometrySource,
        srid: i32,
    ) -> Result<u64, DatabaseError> {
        let existing = self.columns(table)?;
        if existing.iter().any(|c| c.name == column) {
            return Err(DatabaseError::DuplicateColumn {
                table: table.clone(),
                column: column.to_string(),
            });
        }
        for needed in source.columns() {
            if !existing.iter().any(|c| c.name == needed) {
                return Err(DatabaseError::MissingColumn {
                    table: table.clone(),
                    column: needed.to_string(),
                });
            }
        }

        let (value, filter, source_column) = match source {
            GeometrySource::LatLon {
                latitude,
                longitude,
            } => {
                self.check_lat_lon(table, latitude, longitude)?;
                let lat = quote_ident(latitude);
                let lon = quote_ident(longitude);
                (
                    format!(
                        "ST_SetSRID(ST_MakePoint(btrim({lon}::text)::float8, btrim({lat}::text)::float8), {srid})"
                    ),
                    format!("btrim({lat}::text) <> '' AND btrim({lon}::text) <> ''"),
                    format!("{latitude}/{longitude}"),
                )
            }
            GeometrySource::Text {
                column: text_column,
                encoding,
            } => {
                let col = quote_ident(text_column);
                let parse = match encoding {
                    GeometryEncoding::Wkt => format!("ST_GeomFromEWKT(btrim({col}::text))"),
                    GeometryEncoding::WkbHex => {
                        format!("ST_GeomFromEWKB(decode(btrim({col}::text), 'hex'))")
                    }
                    GeometryEncoding::GeoJson => format!("ST_GeomFromGeoJSON(btrim({col}::text))"),
                };
                (
                    format!("ST_SetSRID({parse}, {srid})"),
                    format!("btrim({col}::text) <> ''"),
                    text_column.clone(),
                )
            }
        };

        let t = qualified(table);
        let g = quote_ident(column);
        let alter = format!("ALTER TABLE {t} ADD COLUMN {g} geometry(Geometry, {srid})");
        let update = format!("UPDATE {t} SET {g} = {value} WHERE {filter}");

        self.runtime.block_on(async {
            let mut tx = self.pool.begin().await.map_err(backend)?;
            sqlx::query(&alter)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            let done = sqlx::query(&update)
                .execute(&mut *tx)
                .await
                .map_err(|e| match e {
                    // Parse errors surface as database errors; the transaction rolls back on drop.
                    sqlx::Error::Database(db) => DatabaseError::InvalidGeometry {
                        column: source_column.clone(),
                        row: None,
                        value: None,
                        message: db.message().to_string(),
                    },
                    other => backend(other),
                })?;
            tx.commit().await.map_err(backend)?;
            Ok::<_, DatabaseError>(done.rows_affected())
        })
    }

    fn set_srid(&self, table: &TableRef, column: &str, srid: i32) -> Result<(), DatabaseError> {
        self.runtime
            .block_on(
                sqlx::query_scalar::<_, String>("SELECT UpdateGeometrySRID($1, $2, $3, $4)")
                    .bind(&table.schema)
                    .bind(&table.name)
                    .bind(column)
                    .bind(srid)
                    .fetch_one(&self.pool),
            )
            .map_err(backend)?;
        Ok(())
    }

    fn drop_table(&self, table: &TableRef) -> Result<(), DatabaseError> {
        let sql = format!("DROP TABLE IF EXISTS {}", qualified(table));
        self.runtime
            .block_on(sqlx::query(&sql).execute(&self.pool))
            .map_err(backend)?;
        Ok(())
    }
}

fn backend(e: sqlx::Error) -> DatabaseError {
    DatabaseError::Backend(e.to_string())
}

fn column_type_for(udt_name: &str) -> ColumnType {
    match udt_name {
        "text" | "varchar" | "bpchar" | "name" => ColumnType::Text,
        "int2" | "int4" | "int8" => ColumnType::Integer,
        "float4" | "float8" | "numeric" => ColumnType::Float,
        "bool" => ColumnType::Boolean,
        "geometry" => ColumnType::Geometry { srid: 0 },
        other => ColumnType::Other(other.to_string()),
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn qualified(table: &TableRef) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("lat"), "\"lat\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(
            qualified(&TableRef::new("cdb_importer", "t1")),
            "\"cdb_importer\".\"t1\""
        );
    }

    #[test]
    fn udt_names_map_to_column_types() {
        assert_eq!(column_type_for("varchar"), ColumnType::Text);
        assert_eq!(column_type_for("int8"), ColumnType::Integer);
        assert_eq!(column_type_for("geometry"), ColumnType::Geometry { srid: 0 });
        assert_eq!(column_type_for("jsonb"), ColumnType::Other("jsonb".into()));
    }
}
