//! Configuration for the userexec binary.
//!
//! Loaded from TOML (plus `USEREXEC__*` environment overrides) by the binary;
//! this module only defines the shape, defaults, and how tables are built
//! from it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use userexec_protocol::ColumnDefinition;

use crate::diagnostics::DiagnosticSink;
use crate::runner::ScopedRunner;
use crate::session::SessionBackend;
use crate::table::{DEFAULT_PARALLELISM, DEFAULT_TIMEOUT, UserExecTable};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub runner: RunnerConfig,
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Settings shared by every table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Path to the data-collection binary.
    pub binary: String,
    /// Per-user deadline in seconds.
    pub timeout_secs: u64,
    /// Users queried concurrently per table.
    pub parallelism: usize,
    /// How to enter a user's session.
    pub session: SessionBackend,
    /// Directory for scratch workspaces (system temp dir if unset).
    pub scratch_dir: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            binary: "/usr/local/bin/osqueryd".to_string(),
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            parallelism: DEFAULT_PARALLELISM,
            session: SessionBackend::Auto,
            scratch_dir: None,
        }
    }
}

impl RunnerConfig {
    /// Build the runner these settings describe.
    pub fn build_runner(&self) -> ScopedRunner {
        let runner = ScopedRunner::system(self.session);
        match self.scratch_dir {
            Some(ref dir) => runner.with_scratch_root(dir),
            None => runner,
        }
    }
}

/// One user-scoped table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    /// Query handed to the binary as its final argument.
    pub query: String,
    /// Schema, without the `user` column (always appended).
    #[serde(default)]
    pub columns: Vec<ColumnDefinition>,
    /// Overrides `runner.timeout_secs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Overrides `runner.binary`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
}

impl TableConfig {
    pub fn build(
        &self,
        runner_config: &RunnerConfig,
        runner: ScopedRunner,
        sink: Arc<dyn DiagnosticSink>,
    ) -> UserExecTable {
        let binary = self.binary.as_deref().unwrap_or(&runner_config.binary);
        let timeout = self.timeout_secs.unwrap_or(runner_config.timeout_secs);

        UserExecTable::new(
            self.name.clone(),
            PathBuf::from(binary),
            self.query.clone(),
            self.columns.clone(),
            runner,
        )
        .with_timeout(Duration::from_secs(timeout))
        .with_parallelism(runner_config.parallelism)
        .with_sink(sink)
    }
}

impl AppConfig {
    /// Tables from config, or the built-in default table if none are configured.
    pub fn effective_tables(&self) -> Vec<TableConfig> {
        if self.tables.is_empty() {
            vec![default_table()]
        } else {
            self.tables.clone()
        }
    }

    pub fn table(&self, name: &str) -> Option<TableConfig> {
        self.effective_tables().into_iter().find(|t| t.name == name)
    }
}

/// Screen lock settings are only readable from inside the user's own session.
pub fn default_table() -> TableConfig {
    TableConfig {
        name: "user_screenlock".to_string(),
        query: "select enabled, grace_period from screenlock".to_string(),
        columns: vec![
            ColumnDefinition::integer("enabled"),
            ColumnDefinition::integer("grace_period"),
        ],
        timeout_secs: None,
        binary: None,
    }
}
