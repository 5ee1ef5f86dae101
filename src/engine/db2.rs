use async_trait::async_trait;
use odbc_api::parameter::InputParameter;
use odbc_api::{
    Connection, ConnectionOptions, Cursor, DataType, Environment, IntoParameter,
    ResultSetMetadata,
};
use once_cell::sync::OnceCell;
use tracing::debug;

use super::{ColumnInfo, EngineConnection, EngineDriver, EngineError, EngineKind, EngineRows, ParamValue};

static ODBC_ENV: OnceCell<Environment> = OnceCell::new();

fn odbc_env() -> Result<&'static Environment, EngineError> {
    ODBC_ENV.get_or_try_init(|| {
        Environment::new().map_err(|e| EngineError::Connect(e.to_string()))
    })
}

/// DB2 driver over ODBC. DB2 has no native Rust driver; the CLI interface
/// is ODBC-compatible, so connections go through unixODBC with the IBM CLI
/// driver configured. ODBC calls are blocking and run inside spawn_blocking.
pub struct Db2Driver {
    conn_string: String,
    label: String,
}

impl Db2Driver {
    pub fn new(conn_string: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            conn_string: conn_string.into(),
            label: label.into(),
        }
    }
}

#[async_trait]
impl EngineDriver for Db2Driver {
    fn kind(&self) -> EngineKind {
        EngineKind::Db2
    }

    async fn connect(&self) -> Result<Box<dyn EngineConnection>, EngineError> {
        let conn_string = self.conn_string.clone();
        let label = self.label.clone();
        let conn = tokio::task::spawn_blocking(move || {
            let env = odbc_env()?;
            env.connect_with_connection_string(&conn_string, ConnectionOptions::default())
                .map_err(|e| EngineError::Connect(e.to_string()))
        })
        .await
        .map_err(|e| EngineError::Connect(e.to_string()))??;

        debug!("{label}: db2 connection established");
        Ok(Box::new(Db2Connection { conn: Some(conn) }))
    }
}

pub struct Db2Connection {
    conn: Option<Connection<'static>>,
}

#[async_trait]
impl EngineConnection for Db2Connection {
    async fn execute(
        &mut self,
        sql: &str,
        params: &[ParamValue],
    ) -> Result<EngineRows, EngineError> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| EngineError::ConnectionLost("connection already closed".into()))?;
        let sql = sql.to_string();
        let bound: Vec<Box<dyn InputParameter>> = params.iter().map(bind_value).collect();

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = run_query(&conn, &sql, bound);
            (conn, result)
        })
        .await
        .map_err(|e| EngineError::Execute(e.to_string()))?;

        self.conn = Some(conn);
        result
    }
}

fn run_query(
    conn: &Connection<'static>,
    sql: &str,
    params: Vec<Box<dyn InputParameter>>,
) -> Result<EngineRows, EngineError> {
    let mut prealloc = conn
        .preallocate()
        .map_err(|e| EngineError::Execute(e.to_string()))?;

    {
        let cursor = prealloc
            .execute(sql, &params[..])
            .map_err(|e| EngineError::Execute(e.to_string()))?;
        if let Some(mut cursor) = cursor {
            return collect_rows(&mut cursor);
        }
    }

    // No result set: a DML statement; report the affected row count.
    let affected = prealloc
        .row_count()
        .map_err(|e| EngineError::Execute(e.to_string()))?
        .unwrap_or(0);
    Ok(EngineRows {
        columns: Vec::new(),
        rows: Vec::new(),
        affected_rows: affected as u64,
    })
}

fn collect_rows(cursor: &mut impl Cursor) -> Result<EngineRows, EngineError> {
    let count = cursor
        .num_result_cols()
        .map_err(|e| EngineError::Execute(e.to_string()))? as u16;

    let mut columns = Vec::with_capacity(count as usize);
    for i in 1..=count {
        let name = cursor
            .col_name(i)
            .map_err(|e| EngineError::Execute(e.to_string()))?;
        let data_type = cursor
            .col_data_type(i)
            .map_err(|e| EngineError::Execute(e.to_string()))?;
        columns.push(ColumnInfo {
            name,
            numeric: type_is_numeric(&data_type),
        });
    }

    let mut rows = Vec::new();
    let mut buf = Vec::new();
    while let Some(mut row) = cursor
        .next_row()
        .map_err(|e| EngineError::Execute(e.to_string()))?
    {
        let mut out = Vec::with_capacity(columns.len());
        for i in 1..=count {
            buf.clear();
            let present = row
                .get_text(i, &mut buf)
                .map_err(|e| EngineError::Execute(e.to_string()))?;
            if present {
                out.push(Some(String::from_utf8_lossy(&buf).into_owned()));
            } else {
                out.push(None);
            }
        }
        rows.push(out);
    }

    Ok(EngineRows {
        columns,
        rows,
        affected_rows: 0,
    })
}

fn bind_value(param: &ParamValue) -> Box<dyn InputParameter> {
    match param {
        ParamValue::Text(s) => Box::new(s.clone().into_parameter()),
        ParamValue::Integer(i) => Box::new((*i).into_parameter()),
        ParamValue::Real(f) => Box::new((*f).into_parameter()),
        ParamValue::Boolean(b) => Box::new(i32::from(*b).into_parameter()),
        ParamValue::Null => Box::new(Option::<String>::None.into_parameter()),
    }
}

fn type_is_numeric(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Numeric { .. }
            | DataType::Decimal { .. }
            | DataType::Integer
            | DataType::SmallInt
            | DataType::Float { .. }
            | DataType::Real
            | DataType::Double
            | DataType::BigInt
            | DataType::TinyInt
    )
}
