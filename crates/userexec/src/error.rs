//! Error types for table generation.
//!
//! Errors come in two classes. [`TableError`] fails a whole generation call
//! and reaches the query engine. [`ExecError`] belongs to one user's
//! invocation; the orchestrator reports it and moves on to the next user.

use std::io;
use thiserror::Error;

/// Result type for a table generation call.
pub type TableResult<T> = Result<T, TableError>;

/// Result type for a single user's invocation.
pub type ExecResult<T> = Result<T, ExecError>;

/// Errors that fail the whole table generation call.
#[derive(Debug, Error)]
pub enum TableError {
    /// The query did not constrain the table's required column.
    #[error("missing required constraint: the {table} table requires a {column}")]
    MissingConstraint { table: String, column: String },

    /// A scratch workspace could not be created.
    #[error("creating scratch workspace: {0}")]
    Workspace(#[source] io::Error),
}

/// Errors scoped to one user's invocation.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The username does not resolve to an OS identity.
    #[error("looking up username {username}: {message}")]
    IdentityLookup { username: String, message: String },

    /// The session launcher refused to run as this identity.
    #[error("cannot run as {username}: {message}")]
    Impersonation { username: String, message: String },

    /// A scratch workspace could not be created.
    #[error("creating scratch workspace: {0}")]
    Workspace(#[source] io::Error),

    /// The subprocess could not be started.
    #[error("spawning {program} for {username}: {source}")]
    Spawn {
        username: String,
        program: String,
        #[source]
        source: io::Error,
    },

    /// Waiting on the subprocess or reading its output failed.
    #[error("collecting output for {username}: {source}")]
    Wait {
        username: String,
        #[source]
        source: io::Error,
    },

    /// The subprocess outlived its deadline and was killed.
    #[error("query for {username} timed out after {seconds}s")]
    Timeout { username: String, seconds: u64 },

    /// The caller cancelled the invocation and the subprocess was killed.
    #[error("query for {username} was cancelled")]
    Cancelled { username: String },

    /// The subprocess exited unsuccessfully.
    #[error("running query for {username} {status}. Got: '{stderr}'")]
    NonZeroExit {
        username: String,
        status: String,
        stderr: String,
    },

    /// The subprocess output was not a valid row set.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl ExecError {
    /// Whether this error must abort the whole generation call rather than
    /// only the user that hit it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecError::Workspace(_))
    }
}

/// Errors decoding a subprocess's output.
#[derive(Debug, Error)]
#[error("unmarshalling {bytes} bytes of output: {source}")]
pub struct DecodeError {
    pub bytes: usize,
    #[source]
    pub source: serde_json::Error,
}
