// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::error::HostvisorError;
use crate::helpers::init_path;
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Exclusive advisory lock over the `server.lock` file of an execution directory.
/// The lock is released when the handle is dropped, and by the kernel if the process dies.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    file: File,
}

impl LockHandle {
    /// Attempts to take the lock without blocking.
    /// Returns `Ok(None)` if another supervisor is already holding it.
    pub fn try_acquire<P: AsRef<Path>>(lock_path: P) -> Result<Option<Self>, HostvisorError> {
        let path = lock_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            init_path(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| HostvisorError::LockFileOpenFailure {
                path: path.clone(),
                source,
            })?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {
                debug!("acquired the lock at {}", path.display());
                Ok(Some(LockHandle { path, file }))
            }
            Err(Errno::EWOULDBLOCK) => {
                debug!("{} is already locked", path.display());
                Ok(None)
            }
            Err(source) => Err(HostvisorError::LockFailure { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(err) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            warn!("failed to release the lock at {}: {err}", self.path.display())
        } else {
            debug!("released the lock at {}", self.path.display())
        }
    }
}
