use std::path::Path;

use serde::Deserialize;

use crate::ConduitError;
use crate::engine::EngineKind;

/// Top-level service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub databases: Vec<DatabaseConfig>,
    /// Interval between housekeeping passes (expired-pending sweep, queue
    /// heartbeat logging).
    pub housekeeping_interval_secs: u64,
    /// How long shutdown waits for queues to drain outstanding jobs.
    pub drain_timeout_secs: u64,
    /// How long startup waits for lead queues to connect and bootstrap
    /// before the service is considered up anyway.
    pub startup_wait_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            databases: Vec::new(),
            housekeeping_interval_secs: 30,
            drain_timeout_secs: 10,
            startup_wait_secs: 20,
        }
    }
}

impl ServerConfig {
    /// Load configuration from an optional file layered under
    /// `DBCONDUIT_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConduitError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("DBCONDUIT").separator("__"),
        );
        let settings = builder
            .build()
            .map_err(|e| ConduitError::Config(e.to_string()))?;
        let cfg: ServerConfig = settings
            .try_deserialize()
            .map_err(|e| ConduitError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConduitError> {
        for db in &self.databases {
            if db.name.is_empty() {
                return Err(ConduitError::Config("database name must not be empty".into()));
            }
            if db.connection.is_empty() {
                return Err(ConduitError::Config(format!(
                    "database {} has an empty connection string",
                    db.name
                )));
            }
        }
        Ok(())
    }
}

/// One configured database: engine, connection parameters, bootstrap query,
/// and the per-speed-class queue layout.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub engine: EngineKind,
    pub connection: String,
    /// Executed once by the lead queue; its rows populate the query cache.
    #[serde(default)]
    pub bootstrap_query: Option<String>,
    /// Timeout applied to cache entries whose bootstrap row omits one, and
    /// ceiling for callers that do not request one.
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,
    /// Upper bound on unique queries in a single batch request.
    #[serde(default = "default_max_queries")]
    pub max_queries_per_request: usize,
    /// Connection attempts per round before the database is reported
    /// unavailable.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Base backoff between connection attempts; grows exponentially with
    /// jitter.
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
    #[serde(default)]
    pub queues: QueuesConfig,
}

impl DatabaseConfig {
    pub fn new(
        name: impl Into<String>,
        engine: EngineKind,
        connection: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            engine,
            connection: connection.into(),
            bootstrap_query: None,
            default_timeout_seconds: default_timeout_seconds(),
            max_queries_per_request: default_max_queries(),
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff_ms(),
            queues: QueuesConfig::default(),
        }
    }
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_max_queries() -> usize {
    10
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_connect_backoff_ms() -> u64 {
    200
}

/// Which speed-class queues exist for a database. The slow queue is always
/// present: it is the lead queue and the fallback target for unconfigured
/// classes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    pub slow: QueueConfig,
    pub medium: Option<QueueConfig>,
    pub fast: Option<QueueConfig>,
    pub cache: Option<QueueConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Bounded job backlog; submissions beyond it are rejected as busy.
    pub capacity: usize,
    /// Worker tasks draining the queue. FIFO completion order is only
    /// guaranteed with a single worker.
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            workers: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let cfg = ServerConfig::default();
        assert!(cfg.databases.is_empty());
        assert_eq!(cfg.housekeeping_interval_secs, 30);
        assert_eq!(cfg.drain_timeout_secs, 10);

        let db = DatabaseConfig::new("main", EngineKind::Sqlite, ":memory:");
        assert_eq!(db.default_timeout_seconds, 30);
        assert_eq!(db.max_queries_per_request, 10);
        assert_eq!(db.queues.slow.workers, 1);
        assert!(db.queues.fast.is_none());
    }

    #[test]
    fn validate_rejects_empty_connection() {
        let mut cfg = ServerConfig::default();
        cfg.databases
            .push(DatabaseConfig::new("broken", EngineKind::Postgres, ""));
        assert!(cfg.validate().is_err());
    }
}
