//! Extraction of requested values from a query's constraints.
//!
//! Values pulled from a query end up as subprocess arguments, so every value
//! must consist only of characters from an explicit allowlist. Values that
//! fail the check are dropped, not rejected: the query still runs for the
//! values that pass.

use userexec_protocol::QueryContext;

use crate::diagnostics::DiagnosticSink;

/// Column every userexec table is keyed on.
pub const USER_COLUMN: &str = "user";

/// Characters permitted in a requested username.
pub const ALLOWED_USERNAME_CHARACTERS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_-. ";

/// Collect the values a query places on `column`, whatever the operator.
///
/// Values containing characters outside `allowed` are dropped and reported
/// to `sink`. Repeated values are collapsed, keeping first-seen order. An
/// empty value is kept; it names no account and fails identity lookup later.
pub fn extract_values(
    ctx: &QueryContext,
    column: &str,
    allowed: &str,
    sink: &dyn DiagnosticSink,
) -> Vec<String> {
    let mut values: Vec<String> = Vec::new();

    for constraint in ctx.constraints_for(column) {
        let value = constraint.expression.as_str();
        if !value.chars().all(|c| allowed.contains(c)) {
            sink.constraint_rejected(column, value);
            continue;
        }
        if !values.iter().any(|v| v == value) {
            values.push(value.to_string());
        }
    }

    values
}

/// The usernames a query requests through the `user` column.
pub fn requested_users(ctx: &QueryContext, sink: &dyn DiagnosticSink) -> Vec<String> {
    extract_values(ctx, USER_COLUMN, ALLOWED_USERNAME_CHARACTERS, sink)
}
