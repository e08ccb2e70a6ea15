//! Scratch working directories for subprocess invocations.

use log::{debug, warn};
use std::io;
use std::path::Path;
use tempfile::TempDir;

/// Name prefix for scratch directories.
pub const SCRATCH_PREFIX: &str = "userexec-";

/// Mode applied to scratch directories. The impersonated user must be able to
/// enter the directory, but only this process may write to it.
pub const SCRATCH_MODE: u32 = 0o755;

/// A uniquely named temporary directory owned by one invocation.
///
/// The directory is removed when the workspace is closed or dropped, so it
/// cannot outlive the invocation even if that invocation is cancelled.
#[derive(Debug)]
pub struct ScratchWorkspace {
    dir: TempDir,
}

impl ScratchWorkspace {
    /// Create a fresh workspace under `root`, or the system temp dir if `None`.
    pub fn create(root: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(SCRATCH_PREFIX);
        let dir = match root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(SCRATCH_MODE))?;
        }

        debug!("Created scratch workspace {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the workspace, logging rather than failing if removal errors.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!("Removed scratch workspace {}", path.display()),
            Err(e) => warn!("Failed to remove scratch workspace {}: {}", path.display(), e),
        }
    }
}
