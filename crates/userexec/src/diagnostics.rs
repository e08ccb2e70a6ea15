//! Diagnostic reporting for conditions the orchestrator absorbs.
//!
//! Dropped constraint values and skipped users never surface as errors, so
//! they are handed to a [`DiagnosticSink`] instead. Tables take the sink at
//! construction; [`LogSink`] forwards to the `log` facade.

use log::{debug, warn};

use crate::error::ExecError;

/// Receiver for non-fatal diagnostics raised during table generation.
pub trait DiagnosticSink: Send + Sync {
    /// A constraint value was dropped because it failed the character allowlist.
    fn constraint_rejected(&self, column: &str, value: &str);

    /// A user's invocation failed and contributed no rows.
    fn user_skipped(&self, table: &str, username: &str, error: &ExecError);
}

/// Sink that writes diagnostics through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn constraint_rejected(&self, column: &str, value: &str) {
        debug!(
            "Dropping {} constraint {:?}: contains disallowed characters",
            column, value
        );
    }

    fn user_skipped(&self, table: &str, username: &str, error: &ExecError) {
        warn!("{}: skipping user '{}': {}", table, username, error);
    }
}
