use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ConduitError;
use crate::config::DatabaseConfig;

pub mod mysql;
pub mod postgres;
pub mod sqlite;

#[cfg(feature = "db2")]
pub mod db2;

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Postgres,
    Mysql,
    Sqlite,
    Db2,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Postgres => "postgres",
            EngineKind::Mysql => "mysql",
            EngineKind::Sqlite => "sqlite",
            EngineKind::Db2 => "db2",
        }
    }

    /// Parameter marker style the engine expects. PostgreSQL uses ordinal
    /// `$1..$n` markers; everything else takes `?`.
    pub fn uses_ordinal_markers(&self) -> bool {
        matches!(self, EngineKind::Postgres)
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bound query parameter value, positionally matched to markers in the
/// rewritten SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Text(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Null,
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Text(_) => "text",
            ParamValue::Integer(_) => "integer",
            ParamValue::Real(_) => "real",
            ParamValue::Boolean(_) => "boolean",
            ParamValue::Null => "null",
        }
    }
}

/// Column metadata surfaced by every driver. `numeric` drives the JSON
/// serialization rule: numeric columns are emitted unquoted.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub numeric: bool,
}

/// Raw result set handed back by a driver: column metadata plus row cells
/// already reduced to text (`None` is SQL NULL).
#[derive(Debug, Clone, Default)]
pub struct EngineRows {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<Option<String>>>,
    pub affected_rows: u64,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("execute failed: {0}")]
    Execute(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl EngineError {
    /// True when the persistent connection should be discarded and
    /// re-established before the next job.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, EngineError::Connect(_) | EngineError::ConnectionLost(_))
    }
}

/// Factory half of the driver seam: one instance per configured database,
/// able to mint connections for each worker.
#[async_trait]
pub trait EngineDriver: Send + Sync {
    fn kind(&self) -> EngineKind;

    async fn connect(&self) -> Result<Box<dyn EngineConnection>, EngineError>;
}

/// A live engine connection, exclusively owned by one worker task.
#[async_trait]
pub trait EngineConnection: Send {
    async fn execute(
        &mut self,
        sql: &str,
        params: &[ParamValue],
    ) -> Result<EngineRows, EngineError>;

    async fn close(&mut self) {}
}

/// Registration seam for driver construction, so tests can substitute
/// scripted drivers without touching queue code.
pub trait DriverFactory: Send + Sync {
    fn create(&self, cfg: &DatabaseConfig) -> Result<Arc<dyn EngineDriver>, ConduitError>;
}

/// Builds the real driver for each engine kind.
pub struct DefaultDriverFactory;

impl DriverFactory for DefaultDriverFactory {
    fn create(&self, cfg: &DatabaseConfig) -> Result<Arc<dyn EngineDriver>, ConduitError> {
        let label = format!("{}-{}", cfg.name, cfg.engine);
        match cfg.engine {
            EngineKind::Sqlite => Ok(Arc::new(sqlite::SqliteDriver::new(&cfg.connection, label))),
            EngineKind::Postgres => {
                Ok(Arc::new(postgres::PostgresDriver::new(&cfg.connection, label)))
            }
            EngineKind::Mysql => Ok(Arc::new(mysql::MySqlDriver::new(&cfg.connection, label)?)),
            #[cfg(feature = "db2")]
            EngineKind::Db2 => Ok(Arc::new(db2::Db2Driver::new(&cfg.connection, label))),
            #[cfg(not(feature = "db2"))]
            EngineKind::Db2 => Err(ConduitError::Config(format!(
                "database {} requires DB2 support, but dbconduit was built without the `db2` feature",
                cfg.name
            ))),
        }
    }
}

/// Output of one executed query. Ownership moves worker → pending entry →
/// waiter; engine failures ride inside with `success == false` rather than
/// failing the dispatch.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub success: bool,
    pub row_count: usize,
    pub column_count: usize,
    pub column_names: Vec<String>,
    /// JSON array of row objects.
    pub data_json: String,
    pub affected_rows: u64,
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
}

impl QueryResult {
    pub fn failure(message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            row_count: 0,
            column_count: 0,
            column_names: Vec::new(),
            data_json: "[]".to_string(),
            affected_rows: 0,
            error_message: Some(message.into()),
            execution_time_ms: elapsed.as_millis() as u64,
        }
    }

    /// Serialize an engine result set. Numeric columns become JSON numbers
    /// via an explicit per-column branch, NULL is always the JSON literal
    /// `null`, everything else is an escaped string.
    pub fn from_rows(rows: EngineRows, elapsed: Duration) -> Self {
        let mut out = Vec::with_capacity(rows.rows.len());
        for row in &rows.rows {
            let mut object = serde_json::Map::with_capacity(rows.columns.len());
            for (column, cell) in rows.columns.iter().zip(row) {
                let value = match cell {
                    None => serde_json::Value::Null,
                    Some(text) if column.numeric => numeric_json(text),
                    Some(text) => serde_json::Value::String(text.clone()),
                };
                object.insert(column.name.clone(), value);
            }
            out.push(serde_json::Value::Object(object));
        }

        Self {
            success: true,
            row_count: rows.rows.len(),
            column_count: rows.columns.len(),
            column_names: rows.columns.iter().map(|c| c.name.clone()).collect(),
            data_json: serde_json::Value::Array(out).to_string(),
            affected_rows: rows.affected_rows,
            error_message: None,
            execution_time_ms: elapsed.as_millis() as u64,
        }
    }
}

/// A numeric column whose text does not parse as a number falls back to a
/// quoted string rather than corrupting the payload.
fn numeric_json(text: &str) -> serde_json::Value {
    if let Ok(n) = text.parse::<i64>() {
        return serde_json::Value::Number(n.into());
    }
    if let Ok(f) = text.parse::<f64>()
        && let Some(n) = serde_json::Number::from_f64(f) {
            return serde_json::Value::Number(n);
        }
    serde_json::Value::String(text.to_string())
}
