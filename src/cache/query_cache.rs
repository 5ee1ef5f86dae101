use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::ConduitError;
use crate::queue::QueueClass;

/// One cached query definition, immutable once created by bootstrap.
#[derive(Debug, Clone)]
pub struct QueryCacheEntry {
    pub query_ref: i64,
    pub sql_template: String,
    pub queue_class: QueueClass,
    pub timeout_seconds: u64,
    pub description: Option<String>,
}

/// Per-database map from query reference to cached template. Written once
/// during bootstrap by the lead queue, read concurrently afterwards; one
/// mutex serializes all access.
pub struct QueryTableCache {
    label: String,
    entries: Mutex<HashMap<i64, Arc<QueryCacheEntry>>>,
}

impl QueryTableCache {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_entry(&self, entry: QueryCacheEntry) -> Result<(), ConduitError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&entry.query_ref) {
            return Err(ConduitError::Validation(format!(
                "{}: query ref {} is already cached",
                self.label, entry.query_ref
            )));
        }
        entries.insert(entry.query_ref, Arc::new(entry));
        Ok(())
    }

    pub fn lookup(&self, query_ref: i64) -> Option<Arc<QueryCacheEntry>> {
        self.entries.lock().get(&query_ref).cloned()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Populate from a bootstrap result set (a JSON array of row objects
    /// shaped `{ref, query, name, queue, timeout, type}`). Rows without a
    /// usable `ref` or `query` are skipped with a warning; an unrecognized
    /// `queue` label falls back to the slow class. Returns how many entries
    /// were added.
    pub fn populate_from_bootstrap(
        &self,
        rows: &serde_json::Value,
        default_timeout_seconds: u64,
    ) -> usize {
        let Some(rows) = rows.as_array() else {
            warn!("{}: bootstrap result is not an array; cache stays empty", self.label);
            return 0;
        };

        let mut added = 0;
        for (index, row) in rows.iter().enumerate() {
            let Some(query_ref) = row.get("ref").and_then(json_i64) else {
                warn!("{}: bootstrap row {index} has no usable ref; skipped", self.label);
                continue;
            };
            let Some(sql_template) = row.get("query").and_then(|v| v.as_str()) else {
                warn!(
                    "{}: bootstrap row {index} (ref {query_ref}) has no query text; skipped",
                    self.label
                );
                continue;
            };

            let queue_class = row
                .get("queue")
                .and_then(|v| v.as_str())
                .map(QueueClass::parse)
                .unwrap_or(QueueClass::Slow);
            let timeout_seconds = row
                .get("timeout")
                .and_then(json_u64)
                .unwrap_or(default_timeout_seconds);
            let description = row
                .get("name")
                .and_then(|v| v.as_str())
                .map(str::to_string);

            let entry = QueryCacheEntry {
                query_ref,
                sql_template: sql_template.to_string(),
                queue_class,
                timeout_seconds,
                description,
            };
            match self.add_entry(entry) {
                Ok(()) => added += 1,
                Err(e) => warn!("{}: bootstrap row {index} rejected: {e}", self.label),
            }
        }

        debug!("{}: bootstrap populated {added} cache entries", self.label);
        added
    }
}

/// Numeric bootstrap fields may arrive as JSON numbers or as quoted digits
/// depending on the engine's column typing.
fn json_i64(value: &serde_json::Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn json_u64(value: &serde_json::Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

/// Best-effort extraction of the table named after the first `FROM` in a
/// bootstrap query, used to detect an orphaned table when the bootstrap
/// row set comes back empty. This is a substring scan, not a SQL parse:
/// no `FROM`, or a subquery where a table name would be, skips silently.
pub fn orphan_table_in(sql: &str) -> Option<String> {
    let mut tokens = sql.split_whitespace();
    while let Some(token) = tokens.next() {
        if token.eq_ignore_ascii_case("from") {
            let candidate = tokens.next()?;
            if candidate.starts_with('(') {
                return None;
            }
            let trimmed: String = candidate
                .trim_matches(|c: char| matches!(c, '"' | '`' | '\'' | ';' | ',' | '(' | ')'))
                .to_string();
            if trimmed.is_empty()
                || !trimmed
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$'))
            {
                return None;
            }
            return Some(trimmed);
        }
    }
    None
}
