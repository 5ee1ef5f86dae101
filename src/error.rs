use thiserror::Error;

/// Crate-wide error type.
///
/// Engine execution failures are deliberately *not* represented here: a query
/// that ran and failed comes back inside a completed `QueryResult` with
/// `success == false`, so batch requests degrade per item instead of aborting.
#[derive(Error, Debug)]
pub enum ConduitError {
    /// Unknown database or query reference (client error).
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed or missing parameters, type mismatches (client error).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Queue full, registry growth failure, queue not accepting work
    /// (server busy, retryable).
    #[error("server busy: {0}")]
    Busy(String),

    /// Driver-level fault surfaced outside the normal completion path.
    #[error("engine error: {0}")]
    Engine(String),

    /// Caller's wait exceeded its budget; the query may still be running.
    #[error("query timed out after {0} seconds")]
    Timeout(u64),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
