use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::ConduitError;
use crate::engine::QueryResult;

/// Rendezvous object linking an asynchronously executing query to the
/// caller awaiting its outcome. The worker that runs the matching job
/// signals it exactly once; any number of callers may wait on distinct
/// entries concurrently.
pub struct PendingQueryResult {
    query_id: String,
    timeout: Duration,
    submitted_at: Instant,
    state: Mutex<PendingState>,
    ready: Notify,
}

#[derive(Default)]
struct PendingState {
    completed: bool,
    timed_out: bool,
    result: Option<QueryResult>,
}

impl PendingQueryResult {
    fn new(query_id: String, timeout: Duration) -> Self {
        Self {
            query_id,
            timeout,
            submitted_at: Instant::now(),
            state: Mutex::new(PendingState::default()),
            ready: Notify::new(),
        }
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Deadline is anchored to submission time, so a retried wait never
    /// extends the effective budget.
    pub fn deadline(&self) -> Instant {
        self.submitted_at + self.timeout
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    pub fn is_timed_out(&self) -> bool {
        self.state.lock().timed_out
    }

    /// Consume the signaled result, transferring ownership to the waiter.
    pub fn take_result(&self) -> Option<QueryResult> {
        self.state.lock().result.take()
    }

    /// Block until the worker signals completion or the entry's own
    /// deadline passes. A zero timeout expires immediately.
    pub async fn wait(&self) -> Result<(), ConduitError> {
        if self.wait_until(self.deadline()).await {
            Ok(())
        } else {
            Err(ConduitError::Timeout(self.timeout.as_secs()))
        }
    }

    /// Returns true when completed, false on timeout. The deadline may be
    /// tightened below the entry's own (collective waits).
    async fn wait_until(&self, deadline: Instant) -> bool {
        let mut notified = pin!(self.ready.notified());
        loop {
            // Arm the waiter before checking state so a signal racing this
            // check cannot be missed.
            notified.as_mut().enable();
            if self.state.lock().completed {
                return true;
            }
            if Instant::now() >= deadline {
                self.state.lock().timed_out = true;
                return false;
            }
            if tokio::time::timeout_at(deadline, notified.as_mut())
                .await
                .is_err()
            {
                // Deadline fired; a completion that slipped in concurrently
                // still counts.
                if self.state.lock().completed {
                    return true;
                }
                self.state.lock().timed_out = true;
                return false;
            }
            notified.set(self.ready.notified());
        }
    }
}

/// Wait for every entry to complete, bounded by a collective timeout.
/// Partial completion is reported through each entry's own flags; the call
/// only succeeds when all entries completed in time.
pub async fn wait_multiple(
    pending: &[Arc<PendingQueryResult>],
    collective_timeout: Duration,
) -> Result<(), ConduitError> {
    let collective_deadline = Instant::now() + collective_timeout;
    let mut all_completed = true;
    for entry in pending {
        let deadline = entry.deadline().min(collective_deadline);
        if !entry.wait_until(deadline).await {
            all_completed = false;
        }
    }
    if all_completed {
        Ok(())
    } else {
        Err(ConduitError::Timeout(collective_timeout.as_secs()))
    }
}

/// Registry of all in-flight queries. One mutex guards the backing array;
/// waiting itself never holds it, so registration and signaling proceed
/// while callers are blocked.
pub struct PendingResultManager {
    label: String,
    entries: Mutex<Vec<Arc<PendingQueryResult>>>,
}

impl PendingResultManager {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            entries: Mutex::new(Vec::with_capacity(16)),
        }
    }

    /// Register a new in-flight query. A `query_id` already present is
    /// rejected so the uniqueness invariant never rests on the generator.
    pub fn register(
        &self,
        query_id: &str,
        timeout: Duration,
    ) -> Result<Arc<PendingQueryResult>, ConduitError> {
        if query_id.is_empty() {
            return Err(ConduitError::Validation("query id must not be empty".into()));
        }
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.query_id == query_id) {
            return Err(ConduitError::Validation(format!(
                "query id {query_id} is already registered"
            )));
        }
        let pending = Arc::new(PendingQueryResult::new(query_id.to_string(), timeout));
        entries.push(Arc::clone(&pending));
        drop(entries);
        debug!("{}: registered pending result {query_id}", self.label);
        Ok(pending)
    }

    /// Attach a finished result and wake every waiter. Returns false when no
    /// matching entry exists — not an error, just the race where the waiter
    /// already timed out and was reclaimed; the result is dropped here.
    pub fn signal_ready(&self, query_id: &str, result: QueryResult) -> bool {
        let entry = {
            let entries = self.entries.lock();
            entries.iter().find(|e| e.query_id == query_id).cloned()
        };
        let Some(entry) = entry else {
            debug!(
                "{}: no pending entry for {query_id}; waiter already reclaimed",
                self.label
            );
            return false;
        };
        {
            let mut state = entry.state.lock();
            if state.completed {
                warn!("{}: duplicate signal for {query_id} ignored", self.label);
                return false;
            }
            state.result = Some(result);
            state.completed = true;
        }
        entry.ready.notify_waiters();
        true
    }

    /// Detach an entry, typically called by the waiter to consume it.
    pub fn remove(&self, query_id: &str) -> Option<Arc<PendingQueryResult>> {
        let mut entries = self.entries.lock();
        let index = entries.iter().position(|e| e.query_id == query_id)?;
        Some(entries.swap_remove(index))
    }

    /// Reclaim abandoned entries: past their deadline and never completed.
    /// Any result that arrives later for them is discarded by signal_ready.
    /// Returns the number reclaimed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| {
            let state = entry.state.lock();
            state.completed || now < entry.deadline()
        });
        let reclaimed = before - entries.len();
        drop(entries);
        if reclaimed > 0 {
            debug!("{}: reclaimed {reclaimed} expired pending results", self.label);
        }
        reclaimed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
