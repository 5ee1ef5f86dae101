use async_trait::async_trait;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use super::{ColumnInfo, EngineConnection, EngineDriver, EngineError, EngineKind, EngineRows, ParamValue};

/// SQLite driver. Connections are in-process, so execution runs inline on
/// the worker task the same way pgsqlite drives rusqlite from async context.
pub struct SqliteDriver {
    path: String,
    label: String,
}

impl SqliteDriver {
    pub fn new(path: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            label: label.into(),
        }
    }
}

#[async_trait]
impl EngineDriver for SqliteDriver {
    fn kind(&self) -> EngineKind {
        EngineKind::Sqlite
    }

    async fn connect(&self) -> Result<Box<dyn EngineConnection>, EngineError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;

        let conn = if self.path == ":memory:" {
            Connection::open_with_flags("file::memory:?cache=shared", flags)
        } else {
            Connection::open_with_flags(&self.path, flags)
        }
        .map_err(|e| EngineError::Connect(e.to_string()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;",
        )
        .map_err(|e| EngineError::Connect(e.to_string()))?;

        debug!("{}: opened sqlite database {}", self.label, self.path);
        Ok(Box::new(SqliteConnection { conn }))
    }
}

pub struct SqliteConnection {
    conn: Connection,
}

#[async_trait]
impl EngineConnection for SqliteConnection {
    async fn execute(
        &mut self,
        sql: &str,
        params: &[ParamValue],
    ) -> Result<EngineRows, EngineError> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| EngineError::Execute(e.to_string()))?;

        let bound: Vec<Value> = params.iter().map(bind_value).collect();

        if stmt.column_count() == 0 {
            let affected = stmt
                .execute(rusqlite::params_from_iter(bound))
                .map_err(|e| EngineError::Execute(e.to_string()))?;
            return Ok(EngineRows {
                columns: Vec::new(),
                rows: Vec::new(),
                affected_rows: affected as u64,
            });
        }

        // Declared-type affinity decides the numeric flag; expression columns
        // with no declared type fall back to the first non-null value seen.
        let mut columns: Vec<ColumnInfo> = Vec::with_capacity(stmt.column_count());
        let mut decltype_known: Vec<bool> = Vec::with_capacity(stmt.column_count());
        for column in stmt.columns() {
            let numeric = column.decl_type().map(decltype_is_numeric);
            decltype_known.push(numeric.is_some());
            columns.push(ColumnInfo {
                name: column.name().to_string(),
                numeric: numeric.unwrap_or(false),
            });
        }

        let mut rows_out: Vec<Vec<Option<String>>> = Vec::new();
        let mut rows = stmt
            .query(rusqlite::params_from_iter(bound))
            .map_err(|e| EngineError::Execute(e.to_string()))?;
        while let Some(row) = rows.next().map_err(|e| EngineError::Execute(e.to_string()))? {
            let mut out = Vec::with_capacity(columns.len());
            for (i, column) in columns.iter_mut().enumerate() {
                let value = row
                    .get_ref(i)
                    .map_err(|e| EngineError::Execute(e.to_string()))?;
                if !decltype_known[i]
                    && !matches!(value, ValueRef::Null)
                {
                    decltype_known[i] = true;
                    column.numeric = matches!(value, ValueRef::Integer(_) | ValueRef::Real(_));
                }
                out.push(cell_text(value));
            }
            rows_out.push(out);
        }

        Ok(EngineRows {
            columns,
            rows: rows_out,
            affected_rows: 0,
        })
    }
}

fn bind_value(param: &ParamValue) -> Value {
    match param {
        ParamValue::Text(s) => Value::Text(s.clone()),
        ParamValue::Integer(i) => Value::Integer(*i),
        ParamValue::Real(f) => Value::Real(*f),
        ParamValue::Boolean(b) => Value::Integer(i64::from(*b)),
        ParamValue::Null => Value::Null,
    }
}

fn cell_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
    }
}

fn decltype_is_numeric(decl: &str) -> bool {
    let upper = decl.to_ascii_uppercase();
    upper.contains("INT")
        || upper.contains("REAL")
        || upper.contains("FLOA")
        || upper.contains("DOUB")
        || upper.contains("NUM")
        || upper.contains("DEC")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn executes_select_with_params() {
        let driver = SqliteDriver::new(":memory:", "test-sqlite");
        let mut conn = driver.connect().await.unwrap();
        conn.execute(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT, score REAL)",
            &[],
        )
        .await
        .unwrap();
        conn.execute(
            "INSERT INTO items (id, label, score) VALUES (?, ?, ?)",
            &[
                ParamValue::Integer(1),
                ParamValue::Text("one".into()),
                ParamValue::Real(0.5),
            ],
        )
        .await
        .unwrap();

        let rows = conn
            .execute("SELECT id, label, score FROM items WHERE id = ?", &[ParamValue::Integer(1)])
            .await
            .unwrap();
        assert_eq!(rows.rows.len(), 1);
        assert!(rows.columns[0].numeric);
        assert!(!rows.columns[1].numeric);
        assert!(rows.columns[2].numeric);
        assert_eq!(rows.rows[0][1].as_deref(), Some("one"));
    }

    #[tokio::test]
    async fn dml_reports_affected_rows() {
        let driver = SqliteDriver::new(":memory:", "test-sqlite");
        let mut conn = driver.connect().await.unwrap();
        conn.execute("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();
        conn.execute("INSERT INTO t (v) VALUES (?)", &[ParamValue::Integer(3)])
            .await
            .unwrap();
        let rows = conn
            .execute("UPDATE t SET v = ?", &[ParamValue::Integer(4)])
            .await
            .unwrap();
        assert_eq!(rows.affected_rows, 1);
    }

    #[tokio::test]
    async fn expression_columns_infer_numeric_from_values() {
        let driver = SqliteDriver::new(":memory:", "test-sqlite");
        let mut conn = driver.connect().await.unwrap();
        let rows = conn.execute("SELECT 41 + 1 AS answer", &[]).await.unwrap();
        assert!(rows.columns[0].numeric);
        assert_eq!(rows.rows[0][0].as_deref(), Some("42"));
    }
}
