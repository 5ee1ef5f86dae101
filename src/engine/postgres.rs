use async_trait::async_trait;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls, Row, Statement};
use tracing::{debug, warn};

use super::{ColumnInfo, EngineConnection, EngineDriver, EngineError, EngineKind, EngineRows, ParamValue};

/// PostgreSQL driver over tokio-postgres. Each connection spawns the usual
/// background task that owns the socket.
pub struct PostgresDriver {
    conn_string: String,
    label: String,
}

impl PostgresDriver {
    pub fn new(conn_string: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            conn_string: conn_string.into(),
            label: label.into(),
        }
    }
}

#[async_trait]
impl EngineDriver for PostgresDriver {
    fn kind(&self) -> EngineKind {
        EngineKind::Postgres
    }

    async fn connect(&self) -> Result<Box<dyn EngineConnection>, EngineError> {
        let (client, connection) = tokio_postgres::connect(&self.conn_string, NoTls)
            .await
            .map_err(|e| EngineError::Connect(e.to_string()))?;

        let label = self.label.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("{label}: postgres connection task ended: {e}");
            }
        });

        debug!("{}: postgres connection established", self.label);
        Ok(Box::new(PostgresConnection { client }))
    }
}

pub struct PostgresConnection {
    client: Client,
}

#[async_trait]
impl EngineConnection for PostgresConnection {
    async fn execute(
        &mut self,
        sql: &str,
        params: &[ParamValue],
    ) -> Result<EngineRows, EngineError> {
        if self.client.is_closed() {
            return Err(EngineError::ConnectionLost("client is closed".into()));
        }

        let statement = self
            .client
            .prepare(sql)
            .await
            .map_err(map_pg_error)?;

        let bound: Vec<Box<dyn ToSql + Sync + Send>> = params.iter().map(bind_value).collect();
        let refs: Vec<&(dyn ToSql + Sync)> =
            bound.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();

        if statement.columns().is_empty() {
            let affected = self
                .client
                .execute(&statement, &refs)
                .await
                .map_err(map_pg_error)?;
            return Ok(EngineRows {
                columns: Vec::new(),
                rows: Vec::new(),
                affected_rows: affected,
            });
        }

        let rows = self
            .client
            .query(&statement, &refs)
            .await
            .map_err(map_pg_error)?;

        Ok(collect_rows(&statement, &rows))
    }
}

fn map_pg_error(e: tokio_postgres::Error) -> EngineError {
    if e.is_closed() {
        EngineError::ConnectionLost(e.to_string())
    } else {
        EngineError::Execute(e.to_string())
    }
}

fn bind_value(param: &ParamValue) -> Box<dyn ToSql + Sync + Send> {
    match param {
        ParamValue::Text(s) => Box::new(s.clone()),
        ParamValue::Integer(i) => Box::new(*i),
        ParamValue::Real(f) => Box::new(*f),
        ParamValue::Boolean(b) => Box::new(*b),
        ParamValue::Null => Box::new(Option::<String>::None),
    }
}

fn collect_rows(statement: &Statement, rows: &[Row]) -> EngineRows {
    let columns: Vec<ColumnInfo> = statement
        .columns()
        .iter()
        .map(|c| ColumnInfo {
            name: c.name().to_string(),
            numeric: type_is_numeric(c.type_()),
        })
        .collect();

    let data = rows
        .iter()
        .map(|row| {
            (0..columns.len())
                .map(|i| cell_text(row, i))
                .collect::<Vec<_>>()
        })
        .collect();

    EngineRows {
        columns,
        rows: data,
        affected_rows: 0,
    }
}

fn type_is_numeric(ty: &Type) -> bool {
    *ty == Type::INT2
        || *ty == Type::INT4
        || *ty == Type::INT8
        || *ty == Type::FLOAT4
        || *ty == Type::FLOAT8
        || *ty == Type::NUMERIC
        || *ty == Type::OID
}

/// Reduce one cell to text by column type. Types without a mapping are
/// attempted as text and surface as NULL when the engine refuses.
fn cell_text(row: &Row, i: usize) -> Option<String> {
    let ty = row.columns()[i].type_();
    if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(i).ok().flatten().map(|v| v.to_string())
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(i).ok().flatten().map(|v| v.to_string())
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(i).ok().flatten().map(|v| v.to_string())
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(i).ok().flatten().map(|v| v.to_string())
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(i).ok().flatten().map(|v| v.to_string())
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(i).ok().flatten().map(|v| v.to_string())
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        row.try_get::<_, Option<serde_json::Value>>(i)
            .ok()
            .flatten()
            .map(|v| v.to_string())
    } else {
        row.try_get::<_, Option<String>>(i).ok().flatten()
    }
}
