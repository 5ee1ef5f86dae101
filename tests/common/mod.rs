use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use dbconduit::ConduitError;
use dbconduit::config::DatabaseConfig;
use dbconduit::engine::{
    ColumnInfo, DriverFactory, EngineConnection, EngineDriver, EngineError, EngineKind,
    EngineRows, ParamValue,
};

/// What the scripted driver should do when it sees a SQL text containing
/// the needle.
#[derive(Clone)]
pub struct ScriptedResponse {
    pub delay: Duration,
    pub outcome: Result<EngineRows, String>,
}

impl ScriptedResponse {
    pub fn rows(rows: EngineRows) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Ok(rows),
        }
    }

    pub fn rows_after(rows: EngineRows, delay: Duration) -> Self {
        Self {
            delay,
            outcome: Ok(rows),
        }
    }
}

/// Deterministic in-memory driver: responses are matched by substring
/// against the executed SQL, and every executed statement is recorded so
/// tests can assert on exactly what ran.
pub struct ScriptedDriver {
    responses: Vec<(String, ScriptedResponse)>,
    executed: Arc<Mutex<Vec<String>>>,
}

impl ScriptedDriver {
    pub fn new(responses: Vec<(&str, ScriptedResponse)>) -> Arc<Self> {
        Arc::new(Self {
            responses: responses
                .into_iter()
                .map(|(needle, response)| (needle.to_string(), response))
                .collect(),
            executed: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn executed_matching(&self, needle: &str) -> usize {
        self.executed
            .lock()
            .iter()
            .filter(|sql| sql.contains(needle))
            .count()
    }
}

#[async_trait]
impl EngineDriver for ScriptedDriver {
    fn kind(&self) -> EngineKind {
        EngineKind::Sqlite
    }

    async fn connect(&self) -> Result<Box<dyn EngineConnection>, EngineError> {
        Ok(Box::new(ScriptedConnection {
            responses: self.responses.clone(),
            executed: Arc::clone(&self.executed),
        }))
    }
}

pub struct ScriptedConnection {
    responses: Vec<(String, ScriptedResponse)>,
    executed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl EngineConnection for ScriptedConnection {
    async fn execute(
        &mut self,
        sql: &str,
        _params: &[ParamValue],
    ) -> Result<EngineRows, EngineError> {
        self.executed.lock().push(sql.to_string());
        let Some((_, response)) = self
            .responses
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
        else {
            return Ok(EngineRows::default());
        };
        if !response.delay.is_zero() {
            tokio::time::sleep(response.delay).await;
        }
        match &response.outcome {
            Ok(rows) => Ok(rows.clone()),
            Err(message) => Err(EngineError::Execute(message.clone())),
        }
    }
}

pub struct ScriptedFactory {
    driver: Arc<ScriptedDriver>,
}

impl ScriptedFactory {
    pub fn new(driver: Arc<ScriptedDriver>) -> Arc<Self> {
        Arc::new(Self { driver })
    }
}

impl DriverFactory for ScriptedFactory {
    fn create(&self, _cfg: &DatabaseConfig) -> Result<Arc<dyn EngineDriver>, ConduitError> {
        Ok(Arc::clone(&self.driver) as Arc<dyn EngineDriver>)
    }
}

/// Build an `EngineRows` from column specs `(name, numeric)` and rows of
/// optional cell text.
pub fn engine_rows(columns: &[(&str, bool)], rows: Vec<Vec<Option<&str>>>) -> EngineRows {
    EngineRows {
        columns: columns
            .iter()
            .map(|(name, numeric)| ColumnInfo {
                name: (*name).to_string(),
                numeric: *numeric,
            })
            .collect(),
        rows: rows
            .into_iter()
            .map(|row| row.into_iter().map(|cell| cell.map(str::to_string)).collect())
            .collect(),
        affected_rows: 0,
    }
}

/// One bootstrap row in the shape the lead queue expects.
pub fn bootstrap_row<'a>(
    query_ref: &'a str,
    query: &'a str,
    name: &'a str,
    queue: &'a str,
    timeout: &'a str,
) -> Vec<Option<&'a str>> {
    vec![
        Some(query_ref),
        Some(query),
        Some(name),
        Some(queue),
        Some(timeout),
        Some("0"),
    ]
}

pub const BOOTSTRAP_COLUMNS: [(&str, bool); 6] = [
    ("ref", true),
    ("query", false),
    ("name", false),
    ("queue", false),
    ("timeout", true),
    ("type", true),
];
