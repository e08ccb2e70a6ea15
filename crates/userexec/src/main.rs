use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use userexec::config::AppConfig;
use userexec::constraints::USER_COLUMN;
use userexec::protocol::{ColumnDefinition, QueryContext, Row};
use userexec::{DiagnosticSink, LogSink, TablePlugin, UserExecTable};

const APP_NAME: &str = "userexec";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_query(ctx: RuntimeContext, cmd: QueryCommand) -> Result<()> {
    handle_query(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Query(cmd) => async_query(ctx, cmd),
        Command::Tables => handle_tables(&ctx),
        Command::Init => handle_init(&ctx),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Userexec - run queries inside logged-in users' sessions.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk or spawn any query
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", alias = "force", global = true)]
    assume_yes: bool,
    /// Per-user deadline in seconds (overrides config)
    #[arg(long = "timeout", value_name = "SECONDS", global = true)]
    timeout: Option<u64>,
    /// Number of users queried at once (overrides config)
    #[arg(long = "parallel", value_name = "N", global = true)]
    parallel: Option<usize>,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evaluate a table for one or more users
    Query(QueryCommand),
    /// List configured tables and their columns
    Tables,
    /// Create config directories and default files (`--force` overwrites)
    Init,
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct QueryCommand {
    /// Table to evaluate
    #[arg(value_name = "TABLE")]
    table: String,
    /// User whose session to query (repeatable)
    #[arg(short, long = "user", value_name = "NAME")]
    users: Vec<String>,
    /// Query context in the query engine's JSON form
    #[arg(long, value_name = "JSON")]
    context: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths, &common)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::fmt::writer::BoxMakeWriter;
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level}")));

        let (writer, to_file) = match self.config.logging.file {
            Some(ref file) => {
                let path = expand_str_path(file)?;
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("creating log directory {parent:?}"))?;
                }
                let handle = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("opening log file {}", path.display()))?;
                (BoxMakeWriter::new(Mutex::new(handle)), true)
            }
            None => (BoxMakeWriter::new(io::stderr), false),
        };

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = to_file
                || self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    /// Build a configured table with command-line overrides applied.
    fn build_table(&self, name: &str) -> Result<UserExecTable> {
        let table_config = self
            .config
            .table(name)
            .ok_or_else(|| anyhow!("unknown table '{name}' (see `{APP_NAME} tables`)"))?;

        let mut runner_config = self.config.runner.clone();
        if let Some(ref dir) = runner_config.scratch_dir {
            runner_config.scratch_dir = Some(expand_str_path(dir)?.display().to_string());
        }
        if let Some(parallel) = self.common.parallel {
            runner_config.parallelism = parallel;
        }

        let sink: Arc<dyn DiagnosticSink> = Arc::new(LogSink);
        let table = table_config.build(&runner_config, runner_config.build_runner(), sink);
        Ok(match self.common.timeout {
            Some(secs) => table.with_timeout(Duration::from_secs(secs)),
            None => table,
        })
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self { config_file })
    }
}

async fn handle_query(ctx: &RuntimeContext, cmd: QueryCommand) -> Result<()> {
    let table = ctx.build_table(&cmd.table)?;

    let mut query_ctx = match cmd.context {
        Some(ref json) => QueryContext::from_json(json).context("parsing --context")?,
        None => QueryContext::new(),
    };
    for user in cmd.users {
        query_ctx = query_ctx.with_equals(USER_COLUMN, user);
    }

    if ctx.common.dry_run {
        let request = table.request(&query_ctx)?;
        info!(
            "dry-run: would run {} {:?} as {:?} (timeout {}s)",
            request.probe.binary.display(),
            request.probe.query,
            request.usernames,
            request.probe.timeout.as_secs()
        );
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling in-flight queries");
            interrupt.cancel();
        }
    });

    let rows = TablePlugin::generate(&table, &query_ctx, &cancel)
        .await
        .with_context(|| format!("generating table {}", table.name()))?;
    tracing::debug!(table = table.name(), rows = rows.len(), "table generated");

    print_rows(ctx, &rows)
}

fn print_rows(ctx: &RuntimeContext, rows: &[Row]) -> Result<()> {
    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(rows).context("serializing rows to JSON")?
        );
    } else if ctx.common.yaml {
        print!(
            "{}",
            serde_yaml::to_string(rows).context("serializing rows to YAML")?
        );
    } else {
        for row in rows {
            let line = row
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(" ");
            println!("{line}");
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct TableSummary {
    name: String,
    query: String,
    timeout_secs: u64,
    columns: Vec<ColumnDefinition>,
}

fn handle_tables(ctx: &RuntimeContext) -> Result<()> {
    let summaries = ctx
        .config
        .effective_tables()
        .iter()
        .map(|t| {
            let table = ctx.build_table(&t.name)?;
            Ok(TableSummary {
                name: table.name().to_string(),
                query: table.query().to_string(),
                timeout_secs: table.timeout().as_secs(),
                columns: table.columns().to_vec(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summaries).context("serializing tables to JSON")?
        );
    } else if ctx.common.yaml {
        print!(
            "{}",
            serde_yaml::to_string(&summaries).context("serializing tables to YAML")?
        );
    } else {
        for summary in &summaries {
            println!("{} (timeout {}s)", summary.name, summary.timeout_secs);
            println!("  query: {}", summary.query);
            for column in &summary.columns {
                println!("  {} {}", column.name, column.column_type);
            }
        }
    }
    Ok(())
}

fn handle_init(ctx: &RuntimeContext) -> Result<()> {
    if ctx.paths.config_file.exists() && !ctx.common.assume_yes {
        info!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn load_or_init_config(paths: &AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let defaults = AppConfig::default();
    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", defaults.logging.level)?
        .set_default("runner.binary", defaults.runner.binary)?
        .set_default("runner.timeout_secs", defaults.runner.timeout_secs as i64)?
        .set_default("runner.parallelism", defaults.runner.parallelism as i64)?
        .set_default("runner.session", "auto")?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig {
        tables: vec![userexec::config::default_table()],
        ..AppConfig::default()
    };
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config: {}", self.config_file.display())
    }
}
