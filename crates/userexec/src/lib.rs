//! User-scoped command execution for virtual tables.
//!
//! Some OS state (keychain, per-user preferences) is only visible from inside
//! a logged-in user's own session; neither root nor sudo sees it. This
//! library runs a data-collection binary inside each requested user's session
//! and republishes its output as rows of a virtual table:
//!
//! - [`constraints`]: pick requested usernames out of a query
//! - [`runner`]: run the binary as one user, in a scratch dir, under a deadline
//! - [`decode`]: turn the binary's JSON output into rows
//! - [`table`]: fan out over users, tag and merge their rows

pub mod config;
pub mod constraints;
pub mod decode;
pub mod diagnostics;
pub mod error;
pub mod runner;
pub mod session;
pub mod table;
pub mod workspace;

pub use diagnostics::{DiagnosticSink, LogSink};
pub use error::{DecodeError, ExecError, TableError};
pub use runner::{Probe, ScopedRunner};
pub use session::{IdentityResolver, SessionBackend, SessionLauncher, SystemSession, UserIdentity};
pub use table::{TablePlugin, TableRequest, UserExecTable};
pub use userexec_protocol as protocol;
