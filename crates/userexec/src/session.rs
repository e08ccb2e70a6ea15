//! Identity lookup and session impersonation.
//!
//! Both are platform mechanisms, so the runner only sees them through two
//! narrow capabilities:
//!
//! - [`IdentityResolver`]: turn a username into a [`UserIdentity`]
//! - [`SessionLauncher`]: build a command that runs inside that identity's session
//!
//! [`SystemSession`] implements both with the host's own tools:
//!
//! - macOS: `launchctl asuser <uid> <program>`
//! - Linux as root: `runuser -u <user> -- <program>`
//! - Linux otherwise: `sudo -n -u <user> -- <program>`
//!
//! None of these create a session. A user who is not logged in simply yields
//! no data.

use async_trait::async_trait;
use log::debug;
use rustix::process::geteuid;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;

use crate::error::{ExecError, ExecResult};

/// A username resolved to its numeric uid. Resolved per invocation, never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub username: String,
    pub uid: u32,
}

/// Resolves usernames to OS identities.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, username: &str) -> ExecResult<UserIdentity>;
}

/// Builds commands that execute inside a user's session.
pub trait SessionLauncher: Send + Sync {
    /// Return a command for `program` scoped to `identity`. Callers append
    /// the program's own arguments.
    fn command(&self, identity: &UserIdentity, program: &Path) -> ExecResult<Command>;
}

/// How [`SystemSession`] enters a user's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    /// Pick per platform and privilege.
    #[default]
    Auto,
    /// `launchctl asuser` (macOS).
    Launchctl,
    /// `runuser -u` (Linux, requires root).
    Runuser,
    /// `sudo -n -u` (requires a matching sudoers rule).
    Sudo,
    /// Run directly, only for the identity this process already has.
    Current,
}

impl SessionBackend {
    /// Replace `Auto` with the concrete backend for this host.
    pub fn resolve(self) -> SessionBackend {
        match self {
            SessionBackend::Auto if cfg!(target_os = "macos") => SessionBackend::Launchctl,
            SessionBackend::Auto if geteuid().is_root() => SessionBackend::Runuser,
            SessionBackend::Auto => SessionBackend::Sudo,
            other => other,
        }
    }
}

/// Identity lookup and impersonation through the host's own tools.
#[derive(Debug, Clone, Copy)]
pub struct SystemSession {
    backend: SessionBackend,
}

impl SystemSession {
    pub fn new(backend: SessionBackend) -> Self {
        Self {
            backend: backend.resolve(),
        }
    }

    pub fn backend(&self) -> SessionBackend {
        self.backend
    }
}

impl Default for SystemSession {
    fn default() -> Self {
        Self::new(SessionBackend::Auto)
    }
}

#[async_trait]
impl IdentityResolver for SystemSession {
    async fn resolve(&self, username: &str) -> ExecResult<UserIdentity> {
        let lookup_error = |message: String| ExecError::IdentityLookup {
            username: username.to_string(),
            message,
        };

        let output = Command::new("id")
            .args(["--", username])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| lookup_error(format!("running id: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = match stderr.trim() {
                "" => "no such user".to_string(),
                text => text.to_string(),
            };
            return Err(lookup_error(message));
        }

        let uid = parse_id_output(&String::from_utf8_lossy(&output.stdout), username)
            .map_err(lookup_error)?;

        debug!("Resolved user '{}' to uid {}", username, uid);
        Ok(UserIdentity {
            username: username.to_string(),
            uid,
        })
    }
}

/// Extract the uid from `id` output (`uid=501(alice) gid=20(staff) ...`).
///
/// `id` also accepts a numeric uid in place of a name, so the reported
/// account name must equal `username` exactly.
fn parse_id_output(output: &str, username: &str) -> Result<u32, String> {
    let unexpected = || format!("unexpected id output: {:?}", output.trim());
    let (uid, rest) = output
        .trim_start()
        .strip_prefix("uid=")
        .and_then(|rest| rest.split_once('('))
        .ok_or_else(unexpected)?;
    let (name, _) = rest.split_once(')').ok_or_else(unexpected)?;

    if name != username {
        return Err(format!("no user named {username} (resolves to {name})"));
    }

    uid.parse::<u32>().map_err(|e| format!("parsing uid: {e}"))
}

impl SessionLauncher for SystemSession {
    fn command(&self, identity: &UserIdentity, program: &Path) -> ExecResult<Command> {
        let command = match self.backend.resolve() {
            SessionBackend::Launchctl => {
                let mut c = Command::new("launchctl");
                c.arg("asuser").arg(identity.uid.to_string()).arg(program);
                c
            }
            SessionBackend::Runuser => {
                let mut c = Command::new("runuser");
                c.args(["-u", identity.username.as_str(), "--"]).arg(program);
                c
            }
            SessionBackend::Sudo => {
                let mut c = Command::new("sudo");
                c.args(["-n", "-u", identity.username.as_str(), "--"])
                    .arg(program);
                c
            }
            SessionBackend::Current => {
                let euid = geteuid().as_raw();
                if identity.uid != euid {
                    return Err(ExecError::Impersonation {
                        username: identity.username.clone(),
                        message: format!(
                            "current session backend only runs as uid {euid}, not {}",
                            identity.uid
                        ),
                    });
                }
                Command::new(program)
            }
            SessionBackend::Auto => unreachable!("SessionBackend::resolve never returns Auto"),
        };
        Ok(command)
    }
}
