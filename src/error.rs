// src/error.rs

use thiserror::Error;

/// Core error types for Cellar
#[derive(Error, Debug)]
pub enum Error {
    /// Dependency graph contains a cycle; the path lists the nodes forming it
    #[error("circular dependency: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    /// Formula name could not be resolved by the catalog
    #[error("formula not found: {0}")]
    NotFound(String),

    /// Downloaded content did not match its declared checksum
    #[error("integrity mismatch: expected sha256 {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    /// Transport-level fetch failure (network, HTTP status, timeout)
    #[error("fetch unavailable: {0}")]
    FetchUnavailable(String),

    /// A build step exited nonzero; remaining steps were not run
    #[error("build step {step_index} failed with exit status {exit_status}")]
    BuildStepFailed {
        step_index: usize,
        exit_status: i32,
        output: String,
    },

    /// Post-install test failed; the install itself stands
    #[error("post-install test failed: {0}")]
    PostInstallTestFailed(String),

    /// A stored receipt could not be read back
    #[error("receipt corrupt for '{name}': {reason}")]
    ReceiptCorrupt { name: String, reason: String },

    /// Formula descriptor violates an invariant
    #[error("invalid formula '{name}': {reason}")]
    InvalidFormula { name: String, reason: String },

    /// The install run was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Receipt database errors
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using Cellar's Error type
pub type Result<T> = std::result::Result<T, Error>;
