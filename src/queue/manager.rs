use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::{DatabaseQueue, QueueClass};
use crate::ConduitError;
use crate::cache::QueryTableCache;
use crate::config::{QueueConfig, ServerConfig};
use crate::engine::{DriverFactory, EngineKind};
use crate::pending::PendingResultManager;

/// Everything the dispatcher needs for one database: the shared query
/// cache plus the per-speed-class queues.
pub struct DatabaseRuntime {
    name: String,
    engine: EngineKind,
    cache: Arc<QueryTableCache>,
    queues: HashMap<QueueClass, Arc<DatabaseQueue>>,
    max_queries_per_request: usize,
    default_timeout_seconds: u64,
}

impl DatabaseRuntime {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    pub fn cache(&self) -> &Arc<QueryTableCache> {
        &self.cache
    }

    pub fn max_queries_per_request(&self) -> usize {
        self.max_queries_per_request
    }

    pub fn default_timeout_seconds(&self) -> u64 {
        self.default_timeout_seconds
    }

    pub fn queue(&self, class: QueueClass) -> Option<&Arc<DatabaseQueue>> {
        self.queues.get(&class)
    }

    /// Resolve the queue servicing a speed class, falling back to the slow
    /// queue when the class is not configured for this database. The
    /// fallback trades routing precision for availability.
    pub fn select_queue(&self, class: QueueClass) -> Option<&Arc<DatabaseQueue>> {
        self.queues
            .get(&class)
            .or_else(|| self.queues.get(&QueueClass::Slow))
    }

    /// The lead queue owns bootstrap; it is always the slow queue.
    pub fn lead_queue(&self) -> Option<&Arc<DatabaseQueue>> {
        self.queues.get(&QueueClass::Slow)
    }
}

/// Builds and owns every configured (database × speed class) queue and
/// tears them all down at shutdown.
pub struct QueueManager {
    databases: HashMap<String, Arc<DatabaseRuntime>>,
    drain_timeout: Duration,
}

impl QueueManager {
    pub fn start(
        cfg: &ServerConfig,
        pending: Arc<PendingResultManager>,
        factory: Arc<dyn DriverFactory>,
    ) -> Result<Self, ConduitError> {
        let mut databases = HashMap::new();
        for db_cfg in &cfg.databases {
            let driver = factory.create(db_cfg)?;
            let cache = Arc::new(QueryTableCache::new(format!("qtc-{}", db_cfg.name)));

            let mut queues = HashMap::new();
            let classes: [(QueueClass, Option<&QueueConfig>); 4] = [
                (QueueClass::Slow, Some(&db_cfg.queues.slow)),
                (QueueClass::Medium, db_cfg.queues.medium.as_ref()),
                (QueueClass::Fast, db_cfg.queues.fast.as_ref()),
                (QueueClass::Cache, db_cfg.queues.cache.as_ref()),
            ];
            for (class, queue_cfg) in classes {
                let Some(queue_cfg) = queue_cfg else { continue };
                let is_lead = class == QueueClass::Slow;
                let queue = DatabaseQueue::start(
                    db_cfg,
                    class,
                    queue_cfg,
                    is_lead,
                    Arc::clone(&driver),
                    Arc::clone(&cache),
                    Arc::clone(&pending),
                );
                queues.insert(class, queue);
            }

            info!(
                "database {}: started {} queue(s) on {} engine",
                db_cfg.name,
                queues.len(),
                db_cfg.engine
            );
            databases.insert(
                db_cfg.name.clone(),
                Arc::new(DatabaseRuntime {
                    name: db_cfg.name.clone(),
                    engine: db_cfg.engine,
                    cache,
                    queues,
                    max_queries_per_request: db_cfg.max_queries_per_request,
                    default_timeout_seconds: db_cfg.default_timeout_seconds,
                }),
            );
        }

        Ok(Self {
            databases,
            drain_timeout: Duration::from_secs(cfg.drain_timeout_secs),
        })
    }

    pub fn database(&self, name: &str) -> Option<Arc<DatabaseRuntime>> {
        self.databases.get(name).cloned()
    }

    pub fn database_names(&self) -> Vec<String> {
        self.databases.keys().cloned().collect()
    }

    /// Wait for every lead queue to finish connecting and bootstrapping.
    /// Returns false when any database missed the deadline; the service
    /// still runs, those databases just report unavailable.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut all_ready = true;
        for runtime in self.databases.values() {
            let Some(lead) = runtime.lead_queue() else { continue };
            let remaining = deadline
                .saturating_duration_since(tokio::time::Instant::now());
            if !lead.wait_ready(remaining).await {
                all_ready = false;
            }
        }
        all_ready
    }

    /// Emit one heartbeat log line per queue: connection health, backlog
    /// depth, processed counter.
    pub fn log_heartbeat(&self) {
        for runtime in self.databases.values() {
            for queue in runtime.queues.values() {
                let stats = queue.stats();
                info!(
                    "{}: heartbeat connection {}, queue depth {}, processed {}",
                    queue.label(),
                    if stats.connected { "ok" } else { "down" },
                    stats.depth,
                    stats.processed
                );
            }
        }
    }

    /// Drain every queue: no new jobs, outstanding jobs run until the drain
    /// timeout, then connections close.
    pub async fn shutdown(&self) {
        for runtime in self.databases.values() {
            for queue in runtime.queues.values() {
                queue.shutdown(self.drain_timeout).await;
            }
        }
        info!("queue manager stopped");
    }
}
