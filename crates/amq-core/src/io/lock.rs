//! Advisory file locking for read-modify-write on shared state files
//!
//! The lock is always taken on a sibling path, never on the data file itself.
//! Data files are replaced via atomic rename, and `flock` binds to an inode: a
//! lock held on the old inode would stop serializing anything the moment the
//! file was swapped.

use crate::io::error::QueueError;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// File lock guard that automatically releases on drop
pub struct FileLock {
    file: File,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            // Release the lock
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

/// Run `f` while holding an exclusive advisory lock on `lock_path`.
///
/// The lock file is created if missing. It is released on every exit path,
/// including an unwinding panic, because release happens in the guard's
/// `Drop`. Acquisition blocks without a timeout; callers that need bounded
/// waiting use [`try_acquire_lock`].
pub fn with_lock<T, E, F>(lock_path: &Path, f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
    E: From<QueueError>,
{
    let _guard = acquire_lock(lock_path)?;
    f()
}

/// Acquire an exclusive lock on `path`, blocking until it is available.
pub fn acquire_lock(path: &Path) -> Result<FileLock, QueueError> {
    let file = open_lock_file(path)?;
    lock_blocking(&file, path)?;
    debug!(lock = %path.display(), "lock acquired");
    Ok(FileLock { file })
}

/// Acquire an exclusive lock on a file with backoff retry
///
/// Attempts to acquire a lock with exponential backoff:
/// - Attempt 0: No wait
/// - Attempt 1: 50ms wait
/// - Attempt 2: 100ms wait
/// - Attempt 3: 200ms wait
/// - Attempt 4: 400ms wait
/// - Attempt 5: 800ms wait
///
/// Returns `QueueError::LockTimeout` if the lock is still held elsewhere after
/// all retries.
pub fn try_acquire_lock(path: &Path, max_retries: u32) -> Result<FileLock, QueueError> {
    let file = open_lock_file(path)?;

    for attempt in 0..=max_retries {
        if try_lock_once(&file, path)? {
            return Ok(FileLock { file });
        }

        // Someone else has the lock
        if attempt < max_retries {
            let wait_ms = 50u64 * (1 << attempt);
            std::thread::sleep(Duration::from_millis(wait_ms));
        }
    }

    Err(QueueError::LockTimeout {
        path: path.to_path_buf(),
        retries: max_retries,
    })
}

fn open_lock_file(path: &Path) -> Result<File, QueueError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| QueueError::io(parent, e))?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| QueueError::io(path, e))
}

#[cfg(unix)]
fn lock_blocking(file: &File, path: &Path) -> Result<(), QueueError> {
    loop {
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if result == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        return Err(QueueError::io(path, err));
    }
}

#[cfg(unix)]
fn try_lock_once(file: &File, path: &Path) -> Result<bool, QueueError> {
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }

    let err = std::io::Error::last_os_error();
    let would_block = err.raw_os_error() == Some(libc::EWOULDBLOCK)
        || err.raw_os_error() == Some(libc::EAGAIN)
        || err.kind() == std::io::ErrorKind::Interrupted;
    if would_block {
        Ok(false)
    } else {
        Err(QueueError::io(path, err))
    }
}

// No advisory locking primitive here: locking is a documented no-op and
// critical sections run unserialized.
#[cfg(not(unix))]
fn lock_blocking(_file: &File, _path: &Path) -> Result<(), QueueError> {
    Ok(())
}

#[cfg(not(unix))]
fn try_lock_once(_file: &File, _path: &Path) -> Result<bool, QueueError> {
    Ok(true)
}
