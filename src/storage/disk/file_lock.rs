//! Data directory locking.
//!
//! A storage instance takes an exclusive OS-level lock on `<data_dir>/.lock`
//! so that two processes never replay or write the same WAL and page files.

use crate::storage::error::{StorageError, StorageResult};
use fs2::FileExt;
use log::{debug, error, info};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

const LOCK_FILE_NAME: &str = ".lock";

/// An exclusive lock on a data directory, released on drop.
pub struct DataDirLock {
    file: File,
    path: PathBuf,
}

impl DataDirLock {
    /// Acquire the lock without blocking. Fails with [`StorageError::Locked`]
    /// if another holder already has it.
    pub fn acquire(data_dir: impl AsRef<Path>) -> StorageResult<Self> {
        let data_dir = data_dir.as_ref();
        let lock_path = data_dir.join(LOCK_FILE_NAME);

        if !data_dir.exists() {
            fs::create_dir_all(data_dir)?;
            debug!("Created data directory {:?}", data_dir);
        }

        let file = File::create(&lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                info!("Acquired exclusive lock on {:?}", lock_path);
                Ok(Self {
                    file,
                    path: lock_path,
                })
            }
            Err(e) if is_contended(&e) => {
                error!("Data directory {:?} is already locked", data_dir);
                Err(StorageError::Locked(data_dir.to_path_buf()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.path
    }
}

fn is_contended(e: &io::Error) -> bool {
    // EAGAIN on Linux, EWOULDBLOCK on macOS
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == Some(11)
        || e.raw_os_error() == Some(35)
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            error!("Failed to release lock {:?}: {}", self.path, e);
        } else {
            debug!("Released lock {:?}", self.path);
        }
    }
}
