//! Scoped process runner.
//!
//! Runs the data-collection binary inside one user's session. Every
//! invocation walks the same linear pipeline:
//!
//! 1. resolve the username to an identity
//! 2. create a fresh scratch workspace
//! 3. spawn the binary through the session launcher, cwd pinned to the workspace
//! 4. wait for exit, the deadline, or cancellation, whichever comes first
//! 5. remove the workspace
//!
//! There is no retry. A child that misses its deadline or is cancelled is
//! killed and reaped before the workspace goes away, and a child whose runner
//! future is dropped is killed on drop.

use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::error::{ExecError, ExecResult};
use crate::session::{IdentityResolver, SessionBackend, SessionLauncher, SystemSession, UserIdentity};
use crate::workspace::ScratchWorkspace;

/// Flags that keep the binary ephemeral: no config, no event subscriptions,
/// no database, no audit, single-shot, JSON output.
pub const EPHEMERAL_FLAGS: &[&str] = &[
    "--config_path",
    "/dev/null",
    "--disable_events",
    "--disable_database",
    "--disable_audit",
    "--ephemeral",
    "-S",
    "--json",
];

/// How long to wait for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// What to run: the binary, the query handed to it, and the deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub binary: PathBuf,
    pub query: String,
    pub timeout: Duration,
}

impl Probe {
    pub fn new(binary: impl Into<PathBuf>, query: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            query: query.into(),
            timeout,
        }
    }
}

enum Outcome {
    Exited(std::io::Result<(ExitStatus, Vec<u8>, Vec<u8>)>),
    TimedOut,
    Cancelled,
}

/// Runs a [`Probe`] as a given user.
#[derive(Clone)]
pub struct ScopedRunner {
    resolver: Arc<dyn IdentityResolver>,
    launcher: Arc<dyn SessionLauncher>,
    scratch_root: Option<PathBuf>,
}

impl std::fmt::Debug for ScopedRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedRunner")
            .field("scratch_root", &self.scratch_root)
            .finish()
    }
}

impl ScopedRunner {
    pub fn new(resolver: Arc<dyn IdentityResolver>, launcher: Arc<dyn SessionLauncher>) -> Self {
        Self {
            resolver,
            launcher,
            scratch_root: None,
        }
    }

    /// A runner backed by the host's identity lookup and session tools.
    pub fn system(backend: SessionBackend) -> Self {
        let session = Arc::new(SystemSession::new(backend));
        Self::new(session.clone(), session)
    }

    /// Create scratch workspaces under `root` instead of the system temp dir.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    /// Run `probe` in `username`'s session and return its standard output.
    ///
    /// Only [`ExecError::Workspace`] is fatal to the caller; every other
    /// error is specific to this user.
    pub async fn run_for_user(
        &self,
        username: &str,
        probe: &Probe,
        cancel: &CancellationToken,
    ) -> ExecResult<Vec<u8>> {
        let identity = self.resolver.resolve(username).await?;

        let workspace =
            ScratchWorkspace::create(self.scratch_root.as_deref()).map_err(ExecError::Workspace)?;

        let result = match self.launcher.command(&identity, &probe.binary) {
            Ok(mut cmd) => {
                cmd.args(EPHEMERAL_FLAGS)
                    .arg(&probe.query)
                    .current_dir(workspace.path())
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true);
                execute(cmd, &identity, probe, cancel).await
            }
            Err(e) => Err(e),
        };

        workspace.close();
        result
    }
}

async fn execute(
    mut cmd: Command,
    identity: &UserIdentity,
    probe: &Probe,
    cancel: &CancellationToken,
) -> ExecResult<Vec<u8>> {
    let username = identity.username.as_str();
    debug!(
        "Running {} as {} (uid {}), timeout {:?}",
        probe.binary.display(),
        username,
        identity.uid,
        probe.timeout
    );

    if cancel.is_cancelled() {
        return Err(ExecError::Cancelled {
            username: username.to_string(),
        });
    }

    let program = program_name(&cmd);
    let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
        username: username.to_string(),
        program,
        source,
    })?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let outcome = tokio::select! {
        waited = tokio::time::timeout(probe.timeout, wait_with_output(&mut child, stdout, stderr)) => {
            match waited {
                Ok(result) => Outcome::Exited(result),
                Err(_) => Outcome::TimedOut,
            }
        }
        _ = cancel.cancelled() => Outcome::Cancelled,
    };

    match outcome {
        Outcome::Exited(Ok((status, stdout, stderr))) => {
            if status.success() {
                debug!("Query for {} returned {} bytes", username, stdout.len());
                Ok(stdout)
            } else {
                Err(ExecError::NonZeroExit {
                    username: username.to_string(),
                    status: describe_exit(status),
                    stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
                })
            }
        }
        Outcome::Exited(Err(source)) => {
            terminate(&mut child).await;
            Err(ExecError::Wait {
                username: username.to_string(),
                source,
            })
        }
        Outcome::TimedOut => {
            terminate(&mut child).await;
            Err(ExecError::Timeout {
                username: username.to_string(),
                seconds: probe.timeout.as_secs(),
            })
        }
        Outcome::Cancelled => {
            terminate(&mut child).await;
            Err(ExecError::Cancelled {
                username: username.to_string(),
            })
        }
    }
}

async fn wait_with_output<O, E>(
    child: &mut Child,
    stdout: Option<O>,
    stderr: Option<E>,
) -> std::io::Result<(ExitStatus, Vec<u8>, Vec<u8>)>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    tokio::try_join!(child.wait(), read_all(stdout), read_all(stderr))
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Kill the child and wait for it to be reaped, bounded by [`REAP_TIMEOUT`].
async fn terminate(child: &mut Child) {
    let pid = child.id();
    match tokio::time::timeout(REAP_TIMEOUT, child.kill()).await {
        Ok(Ok(())) => debug!("Killed child process {:?}", pid),
        Ok(Err(e)) => warn!("Error killing child process {:?}: {}", pid, e),
        Err(_) => warn!("Timeout waiting for child process {:?} to exit", pid),
    }
}

fn program_name(cmd: &Command) -> String {
    Path::new(cmd.as_std().get_program()).display().to_string()
}

/// Describe an exit status as a short human-readable phrase.
pub fn describe_exit(status: ExitStatus) -> String {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal: Option<i32> = None;

    match (status.code(), signal) {
        (Some(code), _) => format!("exited with code {}", code),
        (None, Some(sig)) => {
            let sig_name = match sig {
                9 => "SIGKILL",
                15 => "SIGTERM",
                11 => "SIGSEGV",
                6 => "SIGABRT",
                _ => "",
            };
            if sig_name.is_empty() {
                format!("killed by signal {}", sig)
            } else {
                format!("killed by {} (signal {})", sig_name, sig)
            }
        }
        (None, None) => "exited (unknown status)".to_string(),
    }
}
