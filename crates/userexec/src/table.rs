//! User-scoped virtual tables.
//!
//! A [`UserExecTable`] answers a query by running one fixed query through the
//! data-collection binary once per requested user, inside that user's
//! session, and merging the results. Each row is tagged with the user it came
//! from.
//!
//! Results depend on the user's session state. A logged-in user (even an
//! inactive one) returns real data, a user who never changed a setting
//! returns the defaults, and a user who is not logged in returns nothing.
//! None of these are errors: a failed user is skipped and the remaining users
//! still produce rows.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use log::debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use userexec_protocol::{ColumnDefinition, QueryContext, Row};

use crate::constraints::{USER_COLUMN, requested_users};
use crate::decode::decode;
use crate::diagnostics::{DiagnosticSink, LogSink};
use crate::error::{ExecError, ExecResult, TableError, TableResult};
use crate::runner::{Probe, ScopedRunner};

/// Default per-user deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of users queried at once.
pub const DEFAULT_PARALLELISM: usize = 4;

/// The contract a query engine consumes: a name, a fixed schema, and a
/// generation callback invoked once per query.
#[async_trait]
pub trait TablePlugin: Send + Sync {
    fn name(&self) -> &str;

    fn columns(&self) -> &[ColumnDefinition];

    async fn generate(
        &self,
        ctx: &QueryContext,
        cancel: &CancellationToken,
    ) -> TableResult<Vec<Row>>;
}

/// The work of one generation call. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRequest {
    pub usernames: Vec<String>,
    pub probe: Probe,
}

/// A virtual table whose rows come from running a query as each requested user.
pub struct UserExecTable {
    name: String,
    columns: Vec<ColumnDefinition>,
    binary: PathBuf,
    query: String,
    timeout: Duration,
    parallelism: usize,
    runner: ScopedRunner,
    sink: Arc<dyn DiagnosticSink>,
}

impl std::fmt::Debug for UserExecTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserExecTable")
            .field("name", &self.name)
            .field("columns", &self.columns)
            .field("binary", &self.binary)
            .field("query", &self.query)
            .field("timeout", &self.timeout)
            .field("parallelism", &self.parallelism)
            .finish()
    }
}

impl UserExecTable {
    /// Build a table. A TEXT `user` column is appended to `columns` unless
    /// one is already present.
    pub fn new(
        name: impl Into<String>,
        binary: impl Into<PathBuf>,
        query: impl Into<String>,
        mut columns: Vec<ColumnDefinition>,
        runner: ScopedRunner,
    ) -> Self {
        if !columns.iter().any(|c| c.name == USER_COLUMN) {
            columns.push(ColumnDefinition::text(USER_COLUMN));
        }

        Self {
            name: name.into(),
            columns,
            binary: binary.into(),
            query: query.into(),
            timeout: DEFAULT_TIMEOUT,
            parallelism: DEFAULT_PARALLELISM,
            runner,
            sink: Arc::new(LogSink),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of users queried concurrently. `1` runs them one after another.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Build the request for `ctx`. Fails if the query names no usable user.
    pub fn request(&self, ctx: &QueryContext) -> TableResult<TableRequest> {
        let usernames = requested_users(ctx, self.sink.as_ref());
        if usernames.is_empty() {
            return Err(TableError::MissingConstraint {
                table: self.name.clone(),
                column: USER_COLUMN.to_string(),
            });
        }

        Ok(TableRequest {
            usernames,
            probe: Probe::new(self.binary.clone(), self.query.clone(), self.timeout),
        })
    }

    /// Generate rows for every user `ctx` requests.
    pub async fn generate(
        &self,
        ctx: &QueryContext,
        cancel: &CancellationToken,
    ) -> TableResult<Vec<Row>> {
        let request = self.request(ctx)?;
        self.execute(&request, cancel).await
    }

    /// Run `request` for each user and merge the tagged rows.
    ///
    /// Per-user failures go to the diagnostic sink and the user is skipped.
    /// Only a scratch workspace failure aborts the call; the remaining
    /// in-flight invocations are dropped, which kills their children and
    /// removes their workspaces.
    pub async fn execute(
        &self,
        request: &TableRequest,
        cancel: &CancellationToken,
    ) -> TableResult<Vec<Row>> {
        debug!(
            "{}: querying {} user(s), parallelism {}",
            self.name,
            request.usernames.len(),
            self.parallelism
        );

        let probe = &request.probe;
        let mut outcomes = std::pin::pin!(
            stream::iter(request.usernames.iter().cloned())
                .map(move |username| {
                    let token = cancel.child_token();
                    async move {
                        let outcome = self.collect_user(&username, probe, &token).await;
                        (username, outcome)
                    }
                })
                .buffered(self.parallelism)
        );

        let mut rows = Vec::new();
        while let Some((username, outcome)) = outcomes.next().await {
            match outcome {
                Ok(user_rows) => {
                    debug!(
                        "{}: {} row(s) for user '{}'",
                        self.name,
                        user_rows.len(),
                        username
                    );
                    rows.extend(user_rows.into_iter().map(|mut row| {
                        row.insert(USER_COLUMN.to_string(), username.clone());
                        row
                    }));
                }
                Err(ExecError::Workspace(e)) => return Err(TableError::Workspace(e)),
                Err(e) => self.sink.user_skipped(&self.name, &username, &e),
            }
        }

        Ok(rows)
    }

    async fn collect_user(
        &self,
        username: &str,
        probe: &Probe,
        cancel: &CancellationToken,
    ) -> ExecResult<Vec<Row>> {
        let raw = self.runner.run_for_user(username, probe, cancel).await?;
        Ok(decode(&raw)?)
    }
}

#[async_trait]
impl TablePlugin for UserExecTable {
    fn name(&self) -> &str {
        UserExecTable::name(self)
    }

    fn columns(&self) -> &[ColumnDefinition] {
        UserExecTable::columns(self)
    }

    async fn generate(
        &self,
        ctx: &QueryContext,
        cancel: &CancellationToken,
    ) -> TableResult<Vec<Row>> {
        UserExecTable::generate(self, ctx, cancel).await
    }
}
