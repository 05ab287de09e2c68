//! Exclusive per-directory instance lock.
//!
//! The sample database corrupts under concurrent writers from separate
//! processes, so exactly one daemon may own a persistence directory. An
//! advisory `flock()` on `instance.lock` enforces it; the kernel releases the
//! lock if the process dies, so stale locks cannot wedge restarts.

#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::core::errors::{LkError, Result};

/// Held for the lifetime of the daemon; dropping releases the lock.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    #[cfg(unix)]
    _flock: nix::fcntl::Flock<std::fs::File>,
    #[cfg(not(unix))]
    _file: std::fs::File,
}

impl InstanceLock {
    /// Acquire the exclusive lock inside `dir`, failing fast when another
    /// process already holds it.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join("instance.lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| LkError::PersistenceUnavailable {
                path: path.clone(),
                details: format!("cannot open lock file: {e}"),
            })?;

        #[cfg(unix)]
        {
            #[allow(deprecated)]
            let flock =
                nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusiveNonblock)
                    .map_err(|(_file, errno)| LkError::PersistenceUnavailable {
                        path: path.clone(),
                        details: format!(
                            "already locked by another loadkeeper instance ({errno}); \
                             one process per storage directory"
                        ),
                    })?;
            // Advisory content only; the flock is what matters.
            let _ = writeln!(&*flock, "{}", std::process::id());
            Ok(Self {
                path,
                _flock: flock,
            })
        }

        #[cfg(not(unix))]
        {
            let _ = writeln!(&file, "{}", std::process::id());
            Ok(Self { path, _file: file })
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
