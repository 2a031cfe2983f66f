//! Run-scoped context: destination table, connection parameters, and the job log.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::observability::JobLog;
use crate::types::TableRef;

/// Schema the importer writes into unless the job says otherwise.
pub const DEFAULT_SCHEMA: &str = "cdb_importer";

const MASK: &str = "********";

/// Destination database connection parameters.
///
/// The password never appears in `Debug` output or in [`ConnectionParams::redacted`].
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_port() -> u16 {
    5432
}

impl ConnectionParams {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            user: user.into(),
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Fill a missing password from `PGPASSWORD`.
    pub fn with_password_from_env(mut self) -> Self {
        if self.password.is_none() {
            self.password = std::env::var("PGPASSWORD").ok().filter(|p| !p.is_empty());
        }
        self
    }

    /// libpq-style connection string for ogr2ogr's PostgreSQL driver (`PG:...`).
    pub fn ogr_datasource(&self) -> String {
        let mut out = format!(
            "PG:host={} port={} user={} dbname={}",
            conninfo_value(&self.host),
            self.port,
            conninfo_value(&self.user),
            conninfo_value(&self.database)
        );
        if let Some(password) = &self.password {
            out.push_str(" password=");
            out.push_str(&conninfo_value(password));
        }
        out
    }

    /// Connection description safe for logs.
    pub fn redacted(&self) -> String {
        let password = if self.password.is_some() { MASK } else { "<none>" };
        format!(
            "host={} port={} user={} dbname={} password={}",
            self.host, self.port, self.user, self.database, password
        )
    }

    /// Replace every occurrence of the password in `text` with a mask.
    ///
    /// Covers the password as written into [`ConnectionParams::ogr_datasource`], quoted and
    /// escaped, as well as the raw value.
    pub fn redact(&self, text: &str) -> String {
        let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) else {
            return text.to_string();
        };
        let escaped = escape_conninfo(password);
        text.replace(&conninfo_value(password), MASK)
            .replace(&escaped, MASK)
            .replace(password, MASK)
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password_set", &self.password.is_some())
            .finish()
    }
}

// Quote a conninfo value when it contains spaces, quotes, or backslashes.
fn conninfo_value(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\'', '\\']) {
        return value.to_string();
    }
    format!("'{}'", escape_conninfo(value))
}

fn escape_conninfo(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Run context threaded through the pipeline.
///
/// Owned by the caller; [`crate::loader::Loader::run`] only borrows it for one run.
#[derive(Clone)]
pub struct Job {
    table_name: String,
    schema: String,
    connection: ConnectionParams,
    log: Arc<dyn JobLog>,
}

impl Job {
    pub fn new(
        table_name: impl Into<String>,
        connection: ConnectionParams,
        log: Arc<dyn JobLog>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            schema: DEFAULT_SCHEMA.to_string(),
            connection,
            log,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Schema-qualified destination table.
    pub fn table(&self) -> TableRef {
        TableRef::new(self.schema.clone(), self.table_name.clone())
    }

    pub fn connection(&self) -> &ConnectionParams {
        &self.connection
    }

    /// Append one line to the job log.
    pub fn log(&self, line: impl AsRef<str>) {
        self.log.append(line.as_ref());
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("table_name", &self.table_name)
            .field("schema", &self.schema)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}
