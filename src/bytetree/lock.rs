//! Cross-process advisory lock built on link counts, not fcntl, so it
//! stays correct on network file systems.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use super::{TreeError, TreeResult};

/// Attempts before giving up on a held lock.
const ATTEMPTS: u32 = 10;

/// Pause between attempts.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// An acquired advisory lock; unlocks on drop.
pub(super) struct FileLock {
    lockpath: PathBuf,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.lockpath) {
            debug!(lockpath = %self.lockpath.display(), %err, "failed to release advisory lock");
        }
    }
}

/// Acquires the lock guarding `file`, retrying up to 10 times with a
/// one-second sleep while another holder is present.
pub(super) fn acquire(file: &Path) -> TreeResult<FileLock> {
    for attempt in 0..ATTEMPTS {
        match try_acquire(file) {
            Ok(lock) => return Ok(lock),
            Err(TreeError::LockHeld) => {
                debug!(file = %file.display(), attempt, "advisory lock held, retrying");
                if attempt + 1 < ATTEMPTS {
                    std::thread::sleep(RETRY_DELAY);
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(TreeError::LockHeld)
}

/// Linux: hard-link the file to an ephemeral name. The link call itself
/// always succeeds while the file exists; ownership is established only
/// when the resulting link count is exactly two (the file plus us).
#[cfg(target_os = "linux")]
fn try_acquire(file: &Path) -> TreeResult<FileLock> {
    use std::os::unix::fs::MetadataExt;

    let lockpath = lock_path(file, &ephemeral_suffix());
    fs::hard_link(file, &lockpath)?;
    let nlink = match fs::metadata(file) {
        Ok(meta) => meta.nlink(),
        Err(err) => {
            let _ = fs::remove_file(&lockpath);
            return Err(err.into());
        }
    };
    if nlink != 2 {
        let _ = fs::remove_file(&lockpath);
        return Err(TreeError::LockHeld);
    }
    Ok(FileLock { lockpath })
}

/// Elsewhere: symlink creation is atomic, so a fixed lock name excludes
/// every other holder.
#[cfg(not(target_os = "linux"))]
fn try_acquire(file: &Path) -> TreeResult<FileLock> {
    let lockpath = lock_path(file, "");
    match std::os::unix::fs::symlink(file, &lockpath) {
        Ok(()) => Ok(FileLock { lockpath }),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Err(TreeError::LockHeld),
        Err(err) => Err(err.into()),
    }
}

fn lock_path(file: &Path, suffix: &str) -> PathBuf {
    let name = file.file_name().and_then(|n| n.to_str()).unwrap_or("bytetree");
    let dir = file.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!(".{name}.lock{suffix}"))
}

/// 64-bit hex suffix unique enough across processes and threads: clock
/// nanos mixed with the pid and a process-local counter.
#[cfg(target_os = "linux")]
fn ephemeral_suffix() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64;
    let pid = std::process::id() as u64;
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:016x}", nanos ^ pid.rotate_left(32) ^ count.rotate_left(48))
}
