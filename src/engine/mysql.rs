use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, Params, Row, Value};
use tracing::debug;

use super::{ColumnInfo, EngineConnection, EngineDriver, EngineError, EngineKind, EngineRows, ParamValue};
use crate::ConduitError;

/// MySQL driver over mysql_async with the minimal feature set.
pub struct MySqlDriver {
    opts: Opts,
    label: String,
}

impl MySqlDriver {
    pub fn new(url: &str, label: impl Into<String>) -> Result<Self, ConduitError> {
        let opts = Opts::from_url(url)
            .map_err(|e| ConduitError::Config(format!("invalid mysql url: {e}")))?;
        Ok(Self {
            opts,
            label: label.into(),
        })
    }
}

#[async_trait]
impl EngineDriver for MySqlDriver {
    fn kind(&self) -> EngineKind {
        EngineKind::Mysql
    }

    async fn connect(&self) -> Result<Box<dyn EngineConnection>, EngineError> {
        let conn = Conn::new(self.opts.clone())
            .await
            .map_err(|e| EngineError::Connect(e.to_string()))?;
        debug!("{}: mysql connection established", self.label);
        Ok(Box::new(MySqlConnection { conn: Some(conn) }))
    }
}

pub struct MySqlConnection {
    conn: Option<Conn>,
}

#[async_trait]
impl EngineConnection for MySqlConnection {
    async fn execute(
        &mut self,
        sql: &str,
        params: &[ParamValue],
    ) -> Result<EngineRows, EngineError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| EngineError::ConnectionLost("connection already closed".into()))?;

        let bound = if params.is_empty() {
            Params::Empty
        } else {
            Params::Positional(params.iter().map(bind_value).collect())
        };

        let mut result = conn.exec_iter(sql, bound).await.map_err(map_mysql_error)?;
        let columns: Vec<ColumnInfo> = result
            .columns()
            .map(|cols| {
                cols.iter()
                    .map(|c| ColumnInfo {
                        name: c.name_str().into_owned(),
                        numeric: type_is_numeric(c.column_type()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let rows: Vec<Row> = result.collect().await.map_err(map_mysql_error)?;
        let affected_rows = result.affected_rows();
        drop(result);

        let data = rows
            .iter()
            .map(|row| {
                (0..columns.len())
                    .map(|i| row.as_ref(i).and_then(cell_text))
                    .collect::<Vec<_>>()
            })
            .collect();

        Ok(EngineRows {
            columns,
            rows: data,
            affected_rows,
        })
    }

    async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.disconnect().await;
        }
    }
}

fn map_mysql_error(e: mysql_async::Error) -> EngineError {
    match e {
        mysql_async::Error::Io(_) => EngineError::ConnectionLost(e.to_string()),
        _ => EngineError::Execute(e.to_string()),
    }
}

fn bind_value(param: &ParamValue) -> Value {
    match param {
        ParamValue::Text(s) => Value::Bytes(s.clone().into_bytes()),
        ParamValue::Integer(i) => Value::Int(*i),
        ParamValue::Real(f) => Value::Double(*f),
        ParamValue::Boolean(b) => Value::Int(i64::from(*b)),
        ParamValue::Null => Value::NULL,
    }
}

fn type_is_numeric(ty: ColumnType) -> bool {
    matches!(
        ty,
        ColumnType::MYSQL_TYPE_DECIMAL
            | ColumnType::MYSQL_TYPE_NEWDECIMAL
            | ColumnType::MYSQL_TYPE_TINY
            | ColumnType::MYSQL_TYPE_SHORT
            | ColumnType::MYSQL_TYPE_LONG
            | ColumnType::MYSQL_TYPE_INT24
            | ColumnType::MYSQL_TYPE_LONGLONG
            | ColumnType::MYSQL_TYPE_FLOAT
            | ColumnType::MYSQL_TYPE_DOUBLE
            | ColumnType::MYSQL_TYPE_YEAR
    )
}

fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Int(i) => Some(i.to_string()),
        Value::UInt(u) => Some(u.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Double(d) => Some(d.to_string()),
        Value::Date(y, m, d, h, min, s, 0) if *h == 0 && *min == 0 && *s == 0 => {
            Some(format!("{y:04}-{m:02}-{d:02}"))
        }
        Value::Date(y, m, d, h, min, s, us) => {
            if *us == 0 {
                Some(format!("{y:04}-{m:02}-{d:02} {h:02}:{min:02}:{s:02}"))
            } else {
                Some(format!("{y:04}-{m:02}-{d:02} {h:02}:{min:02}:{s:02}.{us:06}"))
            }
        }
        Value::Time(neg, days, h, min, s, us) => {
            let sign = if *neg { "-" } else { "" };
            let hours = u32::from(*h) + days * 24;
            if *us == 0 {
                Some(format!("{sign}{hours:02}:{min:02}:{s:02}"))
            } else {
                Some(format!("{sign}{hours:02}:{min:02}:{s:02}.{us:06}"))
            }
        }
    }
}
