//! Durable single-file writes
//!
//! Every file that becomes visible to another process goes through one of two
//! paths here:
//!
//! - [`write_file_atomic`]: temp file in the destination directory, renamed
//!   into place. Used for envelopes, acks and other state files.
//! - [`deliver_via`]: maildir staging, where the temp file lives in a sibling
//!   `tmp/` directory and is renamed into `new/`. [`deliver_via_exclusive`]
//!   is the variant that refuses to replace an existing entry.
//!
//! Both write the payload, fsync the file, fsync the directory holding the new
//! entry, rename, and fsync the destination directory again. A crash before
//! the rename leaves only a temp file that readers never look at.

use crate::io::error::{QueueError, at};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

/// How to treat a directory fsync the filesystem does not support.
///
/// Some filesystems (network mounts, some FUSE drivers) reject `fsync` on a
/// directory descriptor with `EINVAL` or `ENOTSUP`. `Lenient` accepts that and
/// keeps going with the weaker guarantee; `Strict` surfaces the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirSync {
    #[default]
    Lenient,
    Strict,
}

/// Write `data` to `dir/filename` atomically.
///
/// The temp file is created in `dir` itself so the final rename never crosses
/// a filesystem boundary. Returns the final path.
pub fn write_file_atomic(
    dir: &Path,
    filename: &str,
    data: &[u8],
    policy: DirSync,
) -> Result<PathBuf, QueueError> {
    fs::create_dir_all(dir).map_err(at(dir))?;
    let tmp_path = dir.join(temp_name(filename));
    let final_path = dir.join(filename);

    write_and_sync(&tmp_path, data)?;
    if let Err(e) = sync_dir(dir, policy) {
        return Err(cleanup_temp(&tmp_path, e));
    }
    if let Err(e) = rename_replacing(&tmp_path, &final_path) {
        return Err(cleanup_temp(&tmp_path, e));
    }
    sync_dir(dir, policy)?;
    debug!(path = %final_path.display(), bytes = data.len(), "atomic write complete");
    Ok(final_path)
}

/// Stage `data` as `tmp_dir/filename`, then rename it to `dest_dir/filename`.
///
/// This is the maildir delivery step. The staged file is removed if any step
/// after its creation fails.
pub fn deliver_via(
    tmp_dir: &Path,
    dest_dir: &Path,
    filename: &str,
    data: &[u8],
    policy: DirSync,
) -> Result<PathBuf, QueueError> {
    fs::create_dir_all(tmp_dir).map_err(at(tmp_dir))?;
    fs::create_dir_all(dest_dir).map_err(at(dest_dir))?;
    let tmp_path = tmp_dir.join(filename);
    let dest_path = dest_dir.join(filename);

    write_and_sync(&tmp_path, data)?;
    if let Err(e) = sync_dir(tmp_dir, policy) {
        return Err(cleanup_temp(&tmp_path, e));
    }
    if let Err(e) = rename_replacing(&tmp_path, &dest_path) {
        return Err(cleanup_temp(&tmp_path, e));
    }
    sync_dir(dest_dir, policy)?;
    // The tmp entry is already gone; persisting its removal is best-effort.
    let _ = sync_dir(tmp_dir, policy);
    Ok(dest_path)
}

/// Like [`deliver_via`], but never replaces an existing `dest_dir/filename`.
///
/// The staged file is hard-linked into place, which fails atomically when the
/// name is taken; that case surfaces as [`QueueError::AlreadyInInbox`]. On
/// filesystems without hard links it falls back to an existence check and a
/// rename, which is not atomic against a concurrent writer.
pub fn deliver_via_exclusive(
    tmp_dir: &Path,
    dest_dir: &Path,
    filename: &str,
    data: &[u8],
    policy: DirSync,
) -> Result<PathBuf, QueueError> {
    fs::create_dir_all(tmp_dir).map_err(at(tmp_dir))?;
    fs::create_dir_all(dest_dir).map_err(at(dest_dir))?;
    let tmp_path = tmp_dir.join(filename);
    let dest_path = dest_dir.join(filename);

    write_and_sync(&tmp_path, data)?;
    if let Err(e) = sync_dir(tmp_dir, policy) {
        return Err(cleanup_temp(&tmp_path, e));
    }
    if let Err(e) = link_no_replace(&tmp_path, &dest_path) {
        return Err(cleanup_temp(&tmp_path, e));
    }
    sync_dir(dest_dir, policy)?;
    if let Err(e) = fs::remove_file(&tmp_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %tmp_path.display(), error = %e, "failed to remove staged file after link");
        }
    }
    let _ = sync_dir(tmp_dir, policy);
    Ok(dest_path)
}

fn link_no_replace(from: &Path, to: &Path) -> Result<(), QueueError> {
    match fs::hard_link(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(QueueError::AlreadyInInbox {
            path: to.to_path_buf(),
        }),
        Err(e) if is_link_unsupported(&e) => {
            debug!(dest = %to.display(), error = %e, "hard links unsupported, renaming");
            if to.exists() {
                return Err(QueueError::AlreadyInInbox {
                    path: to.to_path_buf(),
                });
            }
            rename_checked(from, to)
        }
        Err(e) => Err(rename_error(from, to, e)),
    }
}

fn is_link_unsupported(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::Unsupported | std::io::ErrorKind::PermissionDenied
    )
}

/// Rename `from` to `to` and fsync both parent directories.
///
/// Used for `new` -> `cur` promotion. Errors keep the OS kind, so a missing
/// source surfaces as [`QueueError::NotFound`].
pub fn move_durable(from: &Path, to: &Path, policy: DirSync) -> Result<(), QueueError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(at(parent))?;
    }
    rename_checked(from, to)?;
    if let Some(parent) = from.parent() {
        sync_dir(parent, policy)?;
    }
    if let Some(parent) = to.parent() {
        sync_dir(parent, policy)?;
    }
    Ok(())
}

/// Fsync a directory so new, renamed or removed entries are durable.
#[cfg(unix)]
pub fn sync_dir(dir: &Path, policy: DirSync) -> Result<(), QueueError> {
    let file = fs::File::open(dir).map_err(at(dir))?;
    match file.sync_all() {
        Ok(()) => Ok(()),
        Err(e) if policy == DirSync::Lenient && is_sync_unsupported(&e) => {
            debug!(dir = %dir.display(), "directory fsync unsupported, continuing");
            Ok(())
        }
        Err(e) => Err(QueueError::io(dir, e)),
    }
}

/// Directory handles cannot be fsynced on this platform; rename durability
/// is left to the filesystem.
#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path, _policy: DirSync) -> Result<(), QueueError> {
    Ok(())
}

#[cfg(unix)]
fn is_sync_unsupported(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINVAL) | Some(libc::ENOTSUP)
    )
}

fn temp_name(filename: &str) -> String {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let salt = uuid::Uuid::new_v4().simple().to_string();
    format!(".{filename}.tmp-{nanos}-{}", &salt[..8])
}

/// Create `path` exclusively, write all bytes and fsync. Removes the file on
/// any failure.
pub(crate) fn write_and_sync(path: &Path, data: &[u8]) -> Result<(), QueueError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).map_err(at(path))?;
    let result = file.write_all(data).and_then(|()| file.sync_all());
    drop(file);
    if let Err(e) = result {
        let _ = fs::remove_file(path);
        return Err(QueueError::io(path, e));
    }
    Ok(())
}

/// Rename with a single overwrite retry.
///
/// Platforms that refuse to replace an existing destination report it as
/// access-denied; in that case the destination is removed and the rename
/// retried once.
fn rename_replacing(from: &Path, to: &Path) -> Result<(), QueueError> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied && to.exists() => {
            debug!(dest = %to.display(), "rename refused over existing file, replacing");
            fs::remove_file(to).map_err(at(to))?;
            rename_checked(from, to)
        }
        Err(e) => Err(rename_error(from, to, e)),
    }
}

fn rename_checked(from: &Path, to: &Path) -> Result<(), QueueError> {
    fs::rename(from, to).map_err(|e| rename_error(from, to, e))
}

fn rename_error(from: &Path, to: &Path, e: std::io::Error) -> QueueError {
    if is_cross_device(&e) {
        return QueueError::CrossDevice {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source: e,
        };
    }
    QueueError::io(from, e)
}

#[cfg(unix)]
fn is_cross_device(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(not(unix))]
fn is_cross_device(_err: &std::io::Error) -> bool {
    false
}

/// Remove a temp file after `primary` failed, reporting both if removal fails.
fn cleanup_temp(path: &Path, primary: QueueError) -> QueueError {
    match fs::remove_file(path) {
        Ok(()) => primary,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => primary,
        Err(e) => QueueError::Cleanup {
            source: Box::new(primary),
            cleanup: e,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn visible_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| !n.starts_with('.'))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_write_file_atomic_creates_file() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("state");

        let path = write_file_atomic(&dir, "a.json", b"{\"n\":1}", DirSync::Lenient).unwrap();

        assert_eq!(path, dir.join("a.json"));
        assert_eq!(fs::read(&path).unwrap(), b"{\"n\":1}");
        // No temp files left behind
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
    }

    #[test]
    fn test_write_file_atomic_replaces_existing() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::write(dir.join("a.json"), b"old").unwrap();

        write_file_atomic(dir, "a.json", b"new content", DirSync::Strict).unwrap();

        assert_eq!(fs::read(dir.join("a.json")).unwrap(), b"new content");
    }

    #[test]
    fn test_crash_before_rename_leaves_no_final_file() {
        let temp_dir = TempDir::new().unwrap();
        let tmp_dir = temp_dir.path().join("tmp");
        let new_dir = temp_dir.path().join("new");
        fs::create_dir_all(&tmp_dir).unwrap();
        fs::create_dir_all(&new_dir).unwrap();

        // Simulate a crash after the staged write but before the rename.
        write_and_sync(&tmp_dir.join("m1.md"), b"complete payload").unwrap();

        assert!(visible_entries(&new_dir).is_empty());
        assert!(!new_dir.join("m1.md").exists());
    }

    #[test]
    fn test_final_file_is_never_partial() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_path_buf();
        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();

        let reader_dir = dir.clone();
        let expected_len = payload.len();
        let reader = std::thread::spawn(move || {
            for _ in 0..2000 {
                if let Ok(data) = fs::read(reader_dir.join("big.bin")) {
                    assert_eq!(data.len(), expected_len, "observed partial write");
                }
            }
        });

        for _ in 0..20 {
            write_file_atomic(&dir, "big.bin", &payload, DirSync::Lenient).unwrap();
        }
        reader.join().unwrap();
    }

    #[test]
    fn test_deliver_via_moves_from_tmp_to_new() {
        let temp_dir = TempDir::new().unwrap();
        let tmp_dir = temp_dir.path().join("tmp");
        let new_dir = temp_dir.path().join("new");

        let path = deliver_via(&tmp_dir, &new_dir, "m1.md", b"hello", DirSync::Lenient).unwrap();

        assert_eq!(path, new_dir.join("m1.md"));
        assert_eq!(fs::read(&path).unwrap(), b"hello");
        assert!(visible_entries(&tmp_dir).is_empty());
    }

    #[test]
    fn test_deliver_via_existing_stage_fails_cleanly() {
        let temp_dir = TempDir::new().unwrap();
        let tmp_dir = temp_dir.path().join("tmp");
        let new_dir = temp_dir.path().join("new");
        fs::create_dir_all(&tmp_dir).unwrap();
        fs::write(tmp_dir.join("m1.md"), b"stale").unwrap();

        let result = deliver_via(&tmp_dir, &new_dir, "m1.md", b"hello", DirSync::Lenient);

        assert!(matches!(result, Err(QueueError::Io { .. })));
        assert!(!new_dir.join("m1.md").exists());
        // The stale stage belongs to someone else and is left alone
        assert_eq!(fs::read(tmp_dir.join("m1.md")).unwrap(), b"stale");
    }

    #[test]
    fn test_deliver_via_exclusive_refuses_existing() {
        let temp_dir = TempDir::new().unwrap();
        let tmp_dir = temp_dir.path().join("tmp");
        let new_dir = temp_dir.path().join("new");
        fs::create_dir_all(&new_dir).unwrap();
        fs::write(new_dir.join("m1.md"), b"theirs").unwrap();

        let err = deliver_via_exclusive(&tmp_dir, &new_dir, "m1.md", b"mine", DirSync::Lenient).unwrap_err();

        assert!(matches!(err, QueueError::AlreadyInInbox { .. }));
        assert_eq!(fs::read(new_dir.join("m1.md")).unwrap(), b"theirs");
        assert!(visible_entries(&tmp_dir).is_empty());
    }

    #[test]
    fn test_deliver_via_exclusive_delivers() {
        let temp_dir = TempDir::new().unwrap();
        let tmp_dir = temp_dir.path().join("tmp");
        let new_dir = temp_dir.path().join("new");

        let path = deliver_via_exclusive(&tmp_dir, &new_dir, "m1.md", b"hello", DirSync::Lenient).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"hello");
        assert!(visible_entries(&tmp_dir).is_empty());
    }

    #[test]
    fn test_move_durable_missing_source_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let from = temp_dir.path().join("new/x.md");
        let to = temp_dir.path().join("cur/x.md");

        let err = move_durable(&from, &to, DirSync::Lenient).unwrap_err();
        assert!(err.is_not_found());
    }

    #[cfg(unix)]
    #[test]
    fn test_sync_dir_missing_dir_errors() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope");
        assert!(sync_dir(&missing, DirSync::Lenient).is_err());
    }

    #[test]
    fn test_temp_name_is_hidden_and_unique() {
        let a = temp_name("m.md");
        let b = temp_name("m.md");
        assert!(a.starts_with(".m.md.tmp-"));
        assert_ne!(a, b);
    }
}
