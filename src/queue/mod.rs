use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ConduitError;
use crate::cache::{QueryTableCache, orphan_table_in};
use crate::config::{DatabaseConfig, QueueConfig};
use crate::engine::{EngineConnection, EngineDriver, ParamValue, QueryResult};
use crate::pending::PendingResultManager;

pub mod manager;

pub use manager::{DatabaseRuntime, QueueManager};

/// Interval between background reconnect attempts once the initial
/// connection round has been exhausted.
const RECONNECT_INTERVAL_SECS: u64 = 5;

/// Speed class routing hint: which worker queue services a query, by its
/// expected execution latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueClass {
    Slow,
    Medium,
    Fast,
    Cache,
}

impl QueueClass {
    pub const ALL: [QueueClass; 4] = [
        QueueClass::Slow,
        QueueClass::Medium,
        QueueClass::Fast,
        QueueClass::Cache,
    ];

    /// Unrecognized labels route to the slow class rather than failing.
    pub fn parse(label: &str) -> QueueClass {
        match label.to_ascii_lowercase().as_str() {
            "medium" => QueueClass::Medium,
            "fast" => QueueClass::Fast,
            "cache" => QueueClass::Cache,
            _ => QueueClass::Slow,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueClass::Slow => "slow",
            QueueClass::Medium => "medium",
            QueueClass::Fast => "fast",
            QueueClass::Cache => "cache",
        }
    }
}

impl fmt::Display for QueueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Created,
    Connecting,
    Ready,
    Draining,
    Stopped,
}

/// Submitted unit of work. Ownership moves dispatcher → queue → worker;
/// the result travels back through the pending-result manager keyed by
/// `query_id`.
#[derive(Debug)]
pub struct QueryJob {
    pub query_id: String,
    pub query_ref: i64,
    pub sql: String,
    pub params: Vec<ParamValue>,
}

#[derive(Debug, Clone)]
pub struct QueueStats {
    pub depth: usize,
    pub processed: u64,
    pub connected: bool,
}

struct QueueCore {
    database: String,
    class: QueueClass,
    label: String,
    is_lead: bool,
    state: Mutex<QueueState>,
    depth: AtomicUsize,
    processed: AtomicU64,
    connected: AtomicBool,
    bootstrap_completed: AtomicBool,
    empty_database: AtomicBool,
    orphaned_table_dropped: AtomicBool,
    ready: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

impl QueueCore {
    fn set_state(&self, next: QueueState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!("{}: {:?} -> {:?}", self.label, *state, next);
            *state = next;
        }
    }
}

/// One work queue for one (database, speed-class) pair. Owns a bounded FIFO
/// of jobs and the worker task(s) that drain it; each worker owns its own
/// engine connection. Exactly one queue per database is the lead queue,
/// responsible for one-time bootstrap of the shared query cache.
pub struct DatabaseQueue {
    core: Arc<QueueCore>,
    sender: Mutex<Option<mpsc::Sender<QueryJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
struct WorkerCtx {
    core: Arc<QueueCore>,
    driver: Arc<dyn EngineDriver>,
    cache: Arc<QueryTableCache>,
    pending: Arc<PendingResultManager>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueryJob>>>,
    bootstrap_sql: Option<String>,
    default_timeout: u64,
    connect_attempts: u32,
    backoff_ms: u64,
}

impl DatabaseQueue {
    pub(crate) fn start(
        db_cfg: &DatabaseConfig,
        class: QueueClass,
        queue_cfg: &QueueConfig,
        is_lead: bool,
        driver: Arc<dyn EngineDriver>,
        cache: Arc<QueryTableCache>,
        pending: Arc<PendingResultManager>,
    ) -> Arc<DatabaseQueue> {
        let label = format!("dqm-{}-{}", db_cfg.name, class);
        let (ready_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        let core = Arc::new(QueueCore {
            database: db_cfg.name.clone(),
            class,
            label,
            is_lead,
            state: Mutex::new(QueueState::Created),
            depth: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            bootstrap_completed: AtomicBool::new(false),
            empty_database: AtomicBool::new(false),
            orphaned_table_dropped: AtomicBool::new(false),
            ready: ready_tx,
            shutdown: shutdown_tx,
        });

        let (tx, rx) = mpsc::channel(queue_cfg.capacity.max(1));
        let ctx = WorkerCtx {
            core: Arc::clone(&core),
            driver,
            cache,
            pending,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            bootstrap_sql: if is_lead { db_cfg.bootstrap_query.clone() } else { None },
            default_timeout: db_cfg.default_timeout_seconds,
            connect_attempts: db_cfg.connect_attempts,
            backoff_ms: db_cfg.connect_backoff_ms,
        };

        let mut workers = Vec::with_capacity(queue_cfg.workers.max(1));
        for idx in 0..queue_cfg.workers.max(1) {
            workers.push(tokio::spawn(worker_main(ctx.clone(), idx)));
        }

        Arc::new(DatabaseQueue {
            core,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    pub fn database(&self) -> &str {
        &self.core.database
    }

    pub fn class(&self) -> QueueClass {
        self.core.class
    }

    pub fn is_lead(&self) -> bool {
        self.core.is_lead
    }

    pub fn label(&self) -> &str {
        &self.core.label
    }

    pub fn state(&self) -> QueueState {
        *self.core.state.lock()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.core.depth.load(Ordering::SeqCst),
            processed: self.core.processed.load(Ordering::SeqCst),
            connected: self.core.connected.load(Ordering::SeqCst),
        }
    }

    pub fn bootstrap_completed(&self) -> bool {
        self.core.bootstrap_completed.load(Ordering::SeqCst)
    }

    pub fn empty_database(&self) -> bool {
        self.core.empty_database.load(Ordering::SeqCst)
    }

    pub fn orphaned_table_dropped(&self) -> bool {
        self.core.orphaned_table_dropped.load(Ordering::SeqCst)
    }

    /// Enqueue a job. Fails when the queue is not ready or its backlog is
    /// full; both are retryable server-busy conditions for the caller.
    pub fn submit(&self, job: QueryJob) -> Result<(), ConduitError> {
        if self.state() != QueueState::Ready {
            return Err(ConduitError::Busy(format!(
                "{} is not accepting work",
                self.core.label
            )));
        }
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(ConduitError::Busy(format!(
                "{} is shutting down",
                self.core.label
            )));
        };
        self.core.depth.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.core.depth.fetch_sub(1, Ordering::SeqCst);
                Err(ConduitError::Busy(format!("{} queue is full", self.core.label)))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.core.depth.fetch_sub(1, Ordering::SeqCst);
                Err(ConduitError::Busy(format!(
                    "{} is shutting down",
                    self.core.label
                )))
            }
        }
    }

    /// Wait until the queue reached the ready state (connection established,
    /// bootstrap finished for the lead queue). Returns false on timeout.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut ready = self.core.ready.subscribe();
        if *ready.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            while ready.changed().await.is_ok() {
                if *ready.borrow() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    /// Stop accepting new jobs; outstanding jobs keep executing until the
    /// drain deadline.
    pub fn begin_drain(&self) {
        self.core.set_state(QueueState::Draining);
        self.sender.lock().take();
        self.core.shutdown.send_replace(true);
    }

    /// Drain and stop. Outstanding jobs run until the queue empties or the
    /// drain timeout elapses, whichever comes first.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.begin_drain();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let deadline = tokio::time::Instant::now() + drain_timeout;
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("{}: drain timeout; aborting worker", self.core.label);
                handle.abort();
            }
        }
        self.core.set_state(QueueState::Stopped);
        info!("{}: stopped", self.core.label);
    }
}

async fn worker_main(ctx: WorkerCtx, idx: usize) {
    if idx == 0 {
        ctx.core.set_state(QueueState::Connecting);
        let mut conn = connect_with_retry(&ctx, ctx.connect_attempts).await;
        if conn.is_none() {
            warn!(
                "{}: database unavailable after {} connection attempts; retrying in background",
                ctx.core.label, ctx.connect_attempts
            );
            conn = retry_until_shutdown(&ctx).await;
        }
        if ctx.core.is_lead
            && let Some(active) = conn.as_mut() {
                run_bootstrap(&ctx, active.as_mut()).await;
            }
        // A drain request may have raced connection setup; never walk the
        // state back from Draining.
        {
            let mut state = ctx.core.state.lock();
            if *state == QueueState::Connecting {
                *state = QueueState::Ready;
            }
        }
        ctx.core.ready.send_replace(true);
        job_loop(&ctx, conn).await;
    } else {
        let mut ready = ctx.core.ready.subscribe();
        let mut shutdown = ctx.core.shutdown.subscribe();
        while !*ready.borrow() {
            tokio::select! {
                changed = ready.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        job_loop(&ctx, None).await;
    }
}

async fn job_loop(ctx: &WorkerCtx, mut conn: Option<Box<dyn EngineConnection>>) {
    loop {
        let job = { ctx.rx.lock().await.recv().await };
        let Some(job) = job else { break };
        ctx.core.depth.fetch_sub(1, Ordering::SeqCst);

        let result = execute_job(ctx, &mut conn, &job).await;
        ctx.core.processed.fetch_add(1, Ordering::SeqCst);

        if !ctx.pending.signal_ready(&job.query_id, result) {
            debug!(
                "{}: result for {} had no waiter; discarded",
                ctx.core.label, job.query_id
            );
        }
    }
    if let Some(mut active) = conn {
        active.close().await;
    }
}

/// Execute one job on this worker's connection, re-establishing it on
/// demand. Engine failures complete the job normally with a failed result;
/// they never tear down the queue.
async fn execute_job(
    ctx: &WorkerCtx,
    conn: &mut Option<Box<dyn EngineConnection>>,
    job: &QueryJob,
) -> QueryResult {
    let started = std::time::Instant::now();

    if conn.is_none() {
        *conn = connect_with_retry(ctx, ctx.connect_attempts).await;
    }
    let Some(active) = conn.as_mut() else {
        return QueryResult::failure(
            format!("database {} is unavailable", ctx.core.database),
            started.elapsed(),
        );
    };

    match active.execute(&job.sql, &job.params).await {
        Ok(rows) => QueryResult::from_rows(rows, started.elapsed()),
        Err(e) if e.is_connection_loss() => {
            warn!("{}: connection lost mid-query: {e}", ctx.core.label);
            ctx.core.connected.store(false, Ordering::SeqCst);
            *conn = None;
            match connect_with_retry(ctx, 1).await {
                Some(mut fresh) => {
                    let outcome = match fresh.execute(&job.sql, &job.params).await {
                        Ok(rows) => QueryResult::from_rows(rows, started.elapsed()),
                        Err(e2) => QueryResult::failure(e2.to_string(), started.elapsed()),
                    };
                    *conn = Some(fresh);
                    outcome
                }
                None => QueryResult::failure(e.to_string(), started.elapsed()),
            }
        }
        Err(e) => QueryResult::failure(e.to_string(), started.elapsed()),
    }
}

async fn connect_with_retry(
    ctx: &WorkerCtx,
    attempts: u32,
) -> Option<Box<dyn EngineConnection>> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match ctx.driver.connect().await {
            Ok(conn) => {
                ctx.core.connected.store(true, Ordering::SeqCst);
                return Some(conn);
            }
            Err(e) => {
                warn!(
                    "{}: connection attempt {attempt}/{attempts} failed: {e}",
                    ctx.core.label
                );
                if attempt < attempts {
                    let exp = 1u64 << (attempt.min(6) - 1);
                    let base = ctx.backoff_ms.saturating_mul(exp);
                    let jitter = rand::rng().random_range(0..=base / 2);
                    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
                }
            }
        }
    }
    ctx.core.connected.store(false, Ordering::SeqCst);
    None
}

async fn retry_until_shutdown(ctx: &WorkerCtx) -> Option<Box<dyn EngineConnection>> {
    let mut shutdown = ctx.core.shutdown.subscribe();
    loop {
        if *shutdown.borrow() {
            return None;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(RECONNECT_INTERVAL_SECS)) => {
                match ctx.driver.connect().await {
                    Ok(conn) => {
                        ctx.core.connected.store(true, Ordering::SeqCst);
                        return Some(conn);
                    }
                    Err(e) => debug!("{}: background reconnect failed: {e}", ctx.core.label),
                }
            }
            _ = shutdown.changed() => return None,
        }
    }
}

/// One-time bootstrap, lead queue only: run the configured bootstrap query
/// and populate the shared query cache from its rows. Every failure mode is
/// soft — the queue still comes up, just with an empty cache. An empty row
/// set additionally triggers the orphaned-table heuristic.
async fn run_bootstrap(ctx: &WorkerCtx, conn: &mut dyn EngineConnection) {
    let core = &ctx.core;
    let Some(sql) = ctx.bootstrap_sql.as_deref() else {
        debug!("{}: no bootstrap query configured", core.label);
        core.bootstrap_completed.store(true, Ordering::SeqCst);
        return;
    };

    info!("{}: executing bootstrap query", core.label);
    let started = std::time::Instant::now();
    match conn.execute(sql, &[]).await {
        Ok(rows) => {
            let row_count = rows.rows.len();
            let result = QueryResult::from_rows(rows, started.elapsed());
            match serde_json::from_str::<serde_json::Value>(&result.data_json) {
                Ok(value) => {
                    let added = ctx.cache.populate_from_bootstrap(&value, ctx.default_timeout);
                    info!(
                        "{}: bootstrap returned {row_count} rows in {}ms, cached {added} queries",
                        core.label, result.execution_time_ms
                    );
                }
                Err(e) => {
                    warn!("{}: bootstrap result was not parseable JSON: {e}", core.label);
                }
            }
            if row_count == 0 {
                core.empty_database.store(true, Ordering::SeqCst);
                drop_orphaned_table(ctx, conn, sql).await;
            }
        }
        Err(e) => {
            warn!(
                "{}: bootstrap query failed: {e}; continuing with an empty query cache",
                core.label
            );
        }
    }
    core.bootstrap_completed.store(true, Ordering::SeqCst);
}

async fn drop_orphaned_table(ctx: &WorkerCtx, conn: &mut dyn EngineConnection, bootstrap_sql: &str) {
    let core = &ctx.core;
    let Some(table) = orphan_table_in(bootstrap_sql) else {
        return;
    };
    info!(
        "{}: empty bootstrap result; dropping orphaned table {table}",
        core.label
    );
    match conn.execute(&format!("DROP TABLE {table}"), &[]).await {
        Ok(_) => core.orphaned_table_dropped.store(true, Ordering::SeqCst),
        Err(e) => warn!("{}: failed to drop orphaned table {table}: {e}", core.label),
    }
}
