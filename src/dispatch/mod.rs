use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::ConduitError;
use crate::cache::QueryCacheEntry;
use crate::params::{self, BoundQuery};
use crate::pending::{self, PendingQueryResult, PendingResultManager};
use crate::queue::{DatabaseRuntime, QueryJob, QueueManager};
use crate::engine::QueryResult;

static QUERY_SEQ: AtomicU64 = AtomicU64::new(0);

/// Process-unique query id: a monotonic sequence number plus a random
/// component.
pub fn generate_query_id() -> String {
    let seq = QUERY_SEQ.fetch_add(1, Ordering::SeqCst);
    format!("q{seq:06}-{}", Uuid::new_v4().simple())
}

/// The cache entry's timeout is a ceiling callers cannot override upward.
fn effective_timeout(requested: Option<u64>, cache_timeout: u64) -> u64 {
    requested.map_or(cache_timeout, |r| r.min(cache_timeout))
}

/// One entry of a batch request.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub query_ref: i64,
    pub params: Option<serde_json::Value>,
}

/// Per-item outcome, independent of its siblings.
#[derive(Debug, Clone)]
pub struct ItemResult {
    pub query_ref: i64,
    pub success: bool,
    pub data: serde_json::Value,
    pub row_count: usize,
    pub error: Option<String>,
}

impl ItemResult {
    fn from_result(query_ref: i64, result: &QueryResult) -> Self {
        let data = serde_json::from_str(&result.data_json)
            .unwrap_or_else(|_| serde_json::Value::Array(Vec::new()));
        Self {
            query_ref,
            success: result.success,
            data,
            row_count: result.row_count,
            error: result.error_message.clone(),
        }
    }

    fn failed(query_ref: i64, error: String) -> Self {
        Self {
            query_ref,
            success: false,
            data: serde_json::Value::Array(Vec::new()),
            row_count: 0,
            error: Some(error),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "query_ref": self.query_ref,
            "success": self.success,
            "data": self.data,
            "row_count": self.row_count,
            "error": self.error,
        })
    }
}

/// Response for a batch request: one result per submitted item, in input
/// order, regardless of completion order.
#[derive(Debug, Clone)]
pub struct BatchResponse {
    pub success: bool,
    pub database: String,
    pub results: Vec<ItemResult>,
    pub total_execution_time_ms: u64,
}

impl BatchResponse {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "success": self.success,
            "results": self.results.iter().map(ItemResult::to_json).collect::<Vec<_>>(),
            "database": self.database,
            "total_execution_time_ms": self.total_execution_time_ms,
        })
    }
}

enum Slot {
    Failed(String),
    Pending(Arc<PendingQueryResult>),
}

/// Request-facing façade: resolves the cache entry, binds parameters,
/// selects a queue by speed class, registers the pending rendezvous,
/// submits, and waits.
pub struct Dispatcher {
    manager: Arc<QueueManager>,
    pending: Arc<PendingResultManager>,
}

impl Dispatcher {
    pub fn new(manager: Arc<QueueManager>, pending: Arc<PendingResultManager>) -> Self {
        Self { manager, pending }
    }

    /// Execute a single cached query and wait for its outcome. Engine
    /// failures come back as a completed `QueryResult` with
    /// `success == false`; only dispatch-level faults are `Err`.
    pub async fn submit_and_wait(
        &self,
        database: &str,
        query_ref: i64,
        params: Option<&serde_json::Value>,
        requested_timeout: Option<u64>,
    ) -> Result<QueryResult, ConduitError> {
        let runtime = self.runtime(database)?;
        let entry = runtime.cache().lookup(query_ref).ok_or_else(|| {
            ConduitError::NotFound(format!(
                "query ref {query_ref} not found in database {database}"
            ))
        })?;

        let pending = self.submit_one(&runtime, &entry, params, requested_timeout)?;
        let query_id = pending.query_id().to_string();
        let outcome = pending.wait().await;
        self.pending.remove(&query_id);
        outcome?;

        pending.take_result().ok_or_else(|| {
            ConduitError::Engine(format!("query {query_id} completed without a result"))
        })
    }

    /// Execute a batch: all jobs are submitted before any wait begins so
    /// execution overlaps, then one collective wait covers them all.
    /// Identical (query_ref, params) items are submitted once and fanned
    /// back out; each position degrades independently.
    pub async fn submit_and_wait_many(
        &self,
        database: &str,
        items: &[BatchItem],
        requested_timeout: Option<u64>,
    ) -> Result<BatchResponse, ConduitError> {
        let started = std::time::Instant::now();
        let runtime = self.runtime(database)?;
        if items.is_empty() {
            return Err(ConduitError::Validation(
                "queries array must not be empty".into(),
            ));
        }

        // Deduplicate identical submissions, remembering where each
        // original position maps.
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut uniques: Vec<&BatchItem> = Vec::new();
        let mut mapping: Vec<usize> = Vec::with_capacity(items.len());
        for item in items {
            let key = format!(
                "{}|{}",
                item.query_ref,
                item.params.as_ref().map_or_else(String::new, |v| v.to_string())
            );
            let index = *seen.entry(key).or_insert_with(|| {
                uniques.push(item);
                uniques.len() - 1
            });
            mapping.push(index);
        }

        let limit = runtime.max_queries_per_request();
        if uniques.len() > limit {
            return Err(ConduitError::Validation(format!(
                "batch exceeds the limit of {limit} unique queries per request"
            )));
        }
        debug!(
            "batch on {database}: {} items, {} unique",
            items.len(),
            uniques.len()
        );

        // Submit everything before waiting on anything.
        let mut slots: Vec<Slot> = Vec::with_capacity(uniques.len());
        let mut collective_timeout = 0u64;
        for item in &uniques {
            match runtime.cache().lookup(item.query_ref) {
                None => slots.push(Slot::Failed(format!(
                    "query ref {} not found in database {database}",
                    item.query_ref
                ))),
                Some(entry) => {
                    collective_timeout = collective_timeout
                        .max(effective_timeout(requested_timeout, entry.timeout_seconds));
                    match self.submit_one(&runtime, &entry, item.params.as_ref(), requested_timeout)
                    {
                        Ok(pending) => slots.push(Slot::Pending(pending)),
                        Err(e) => slots.push(Slot::Failed(e.to_string())),
                    }
                }
            }
        }

        let in_flight: Vec<Arc<PendingQueryResult>> = slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Pending(p) => Some(Arc::clone(p)),
                Slot::Failed(_) => None,
            })
            .collect();
        if !in_flight.is_empty() {
            // Partial completion is reported per entry; the collective
            // verdict falls out of each item below.
            let _ = pending::wait_multiple(
                &in_flight,
                Duration::from_secs(collective_timeout),
            )
            .await;
        }

        let mut unique_results: Vec<ItemResult> = Vec::with_capacity(slots.len());
        for (slot, item) in slots.iter().zip(&uniques) {
            match slot {
                Slot::Failed(error) => {
                    unique_results.push(ItemResult::failed(item.query_ref, error.clone()));
                }
                Slot::Pending(p) => {
                    self.pending.remove(p.query_id());
                    if p.is_completed() {
                        match p.take_result() {
                            Some(result) => unique_results
                                .push(ItemResult::from_result(item.query_ref, &result)),
                            None => unique_results.push(ItemResult::failed(
                                item.query_ref,
                                "query completed without a result".into(),
                            )),
                        }
                    } else {
                        unique_results.push(ItemResult::failed(
                            item.query_ref,
                            "query execution timeout".into(),
                        ));
                    }
                }
            }
        }

        let results: Vec<ItemResult> = mapping
            .iter()
            .map(|&index| unique_results[index].clone())
            .collect();
        let success = results.iter().all(|r| r.success);

        Ok(BatchResponse {
            success,
            database: database.to_string(),
            results,
            total_execution_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn runtime(&self, database: &str) -> Result<Arc<DatabaseRuntime>, ConduitError> {
        self.manager
            .database(database)
            .ok_or_else(|| ConduitError::NotFound(format!("unknown database {database}")))
    }

    /// Bind, register, submit. Any failure after registration unwinds the
    /// pending entry so nothing dangles.
    fn submit_one(
        &self,
        runtime: &DatabaseRuntime,
        entry: &QueryCacheEntry,
        params: Option<&serde_json::Value>,
        requested_timeout: Option<u64>,
    ) -> Result<Arc<PendingQueryResult>, ConduitError> {
        let bound = params::process_parameters(params, &entry.sql_template, runtime.engine())?;
        let queue = runtime.select_queue(entry.queue_class).ok_or_else(|| {
            ConduitError::Busy(format!(
                "database {} has no queues configured",
                runtime.name()
            ))
        })?;

        let query_id = generate_query_id();
        let timeout = effective_timeout(requested_timeout, entry.timeout_seconds);
        let pending = self
            .pending
            .register(&query_id, Duration::from_secs(timeout))?;

        let BoundQuery { sql, params } = bound;
        let job = QueryJob {
            query_id: query_id.clone(),
            query_ref: entry.query_ref,
            sql,
            params: params.into_iter().map(|p| p.value).collect(),
        };
        if let Err(e) = queue.submit(job) {
            self.pending.remove(&query_id);
            return Err(e);
        }
        debug!(
            "submitted query ref {} as {query_id} to {} (timeout {timeout}s)",
            entry.query_ref,
            queue.label()
        );
        Ok(pending)
    }
}
