//! Test utilities: a fake session and a scripted stand-in for the query binary.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::process::Command;
use userexec::error::{ExecError, ExecResult};
use userexec::protocol::ColumnDefinition;
use userexec::{
    DiagnosticSink, IdentityResolver, ScopedRunner, SessionLauncher, UserExecTable, UserIdentity,
};

/// Stand-in for the query binary. Behaviour is keyed on `FAKE_USER`, which
/// [`FakeSession`] sets to the identity the command runs as.
const FAKE_BINARY: &str = r#"#!/bin/sh
for last; do :; done
case "$FAKE_USER" in
  alice|alias) printf '[{"key":"v"}]\n' ;;
  bob) exec sleep 30 ;;
  carol) printf 'not json\n' ;;
  dave) printf 'boom\n' >&2; exit 3 ;;
  erin) printf '[]\n' ;;
  multi) printf '[{"key":"a"},{"key":"b","user":"spoofed"}]\n' ;;
  echo) printf '[{"query":"%s","argc":"%s","cwd":"%s"}]\n' "$last" "$#" "$(pwd)" ;;
  *) printf 'unexpected user %s\n' "$FAKE_USER" >&2; exit 1 ;;
esac
"#;

/// Users the fake session knows about.
pub const KNOWN_USERS: &[(&str, u32)] = &[
    ("alice", 501),
    ("bob", 502),
    ("carol", 503),
    ("dave", 504),
    ("erin", 505),
    ("multi", 506),
    ("echo", 507),
    ("alias", 501),
];

/// Resolves a fixed set of users and runs "as" them by exporting `FAKE_USER`.
///
/// Commands go through `/bin/sh <script>` so the script never needs to be
/// executed directly.
#[derive(Default)]
pub struct FakeSession {
    users: HashMap<String, u32>,
    pub launches: AtomicUsize,
    pub launched_users: Mutex<Vec<String>>,
}

impl FakeSession {
    pub fn new() -> Self {
        Self {
            users: KNOWN_USERS
                .iter()
                .map(|(name, uid)| (name.to_string(), *uid))
                .collect(),
            ..Default::default()
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityResolver for FakeSession {
    async fn resolve(&self, username: &str) -> ExecResult<UserIdentity> {
        match self.users.get(username) {
            Some(uid) => Ok(UserIdentity {
                username: username.to_string(),
                uid: *uid,
            }),
            None => Err(ExecError::IdentityLookup {
                username: username.to_string(),
                message: "no such user".to_string(),
            }),
        }
    }
}

impl SessionLauncher for FakeSession {
    fn command(&self, identity: &UserIdentity, program: &Path) -> ExecResult<Command> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.launched_users
            .lock()
            .unwrap()
            .push(identity.username.clone());

        let mut cmd = Command::new("/bin/sh");
        cmd.arg(program).env("FAKE_USER", &identity.username);
        Ok(cmd)
    }
}

/// Records every diagnostic for later assertions.
#[derive(Default)]
pub struct RecordingSink {
    pub rejected: Mutex<Vec<String>>,
    pub skipped: Mutex<Vec<(String, String)>>,
}

impl RecordingSink {
    pub fn skipped_users(&self) -> Vec<String> {
        self.skipped
            .lock()
            .unwrap()
            .iter()
            .map(|(user, _)| user.clone())
            .collect()
    }

    pub fn skip_reason(&self, username: &str) -> Option<String> {
        self.skipped
            .lock()
            .unwrap()
            .iter()
            .find(|(user, _)| user == username)
            .map(|(_, reason)| reason.clone())
    }
}

impl DiagnosticSink for RecordingSink {
    fn constraint_rejected(&self, _column: &str, value: &str) {
        self.rejected.lock().unwrap().push(value.to_string());
    }

    fn user_skipped(&self, _table: &str, username: &str, error: &ExecError) {
        self.skipped
            .lock()
            .unwrap()
            .push((username.to_string(), error.to_string()));
    }
}

/// Everything one test needs: the table plus handles to inspect afterwards.
pub struct Harness {
    pub table: UserExecTable,
    pub session: Arc<FakeSession>,
    pub sink: Arc<RecordingSink>,
    pub scratch_root: PathBuf,
    _dir: TempDir,
}

impl Harness {
    /// Number of entries left in the scratch root.
    pub fn leftover_workspaces(&self) -> usize {
        std::fs::read_dir(&self.scratch_root).unwrap().count()
    }
}

/// Build a table over the fake binary with its own scratch root.
pub fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let binary = dir.path().join("fake-osqueryd");
    std::fs::write(&binary, FAKE_BINARY).unwrap();
    let scratch_root = dir.path().join("scratch");
    std::fs::create_dir(&scratch_root).unwrap();

    let session = Arc::new(FakeSession::new());
    let sink = Arc::new(RecordingSink::default());
    let runner =
        ScopedRunner::new(session.clone(), session.clone()).with_scratch_root(&scratch_root);

    let table = UserExecTable::new(
        "user_fake",
        binary,
        "select key from fake",
        vec![ColumnDefinition::text("key")],
        runner,
    )
    .with_sink(sink.clone());

    Harness {
        table,
        session,
        sink,
        scratch_root,
        _dir: dir,
    }
}
