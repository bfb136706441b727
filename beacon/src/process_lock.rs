//! Process-level lock guarding the durable queue.
//!
//! `beacon-deliver` keeps the pending queue in memory for its whole run and
//! rewrites the stored record after every batch, so no other process may
//! change the queue while it runs. Both binaries take the same advisory OS
//! file lock (flock), scoped to the database path:
//! - `beacon-deliver` holds it for its lifetime and refuses to start without it.
//! - `beacon` holds it while running a command that changes the queue, and
//!   refuses the command while `beacon-deliver` runs.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

const QUEUE_LOCK_FILE: &str = "beacon-queue.lock";

/// Held while this process owns the pending queue; released on drop.
///
/// The lock file itself is left in place. Unlinking it would let a process
/// that opened the old file and a process creating a new one both lock.
pub struct QueueGuard {
    file: File,
}

impl QueueGuard {
    /// Take ownership of the queue stored at `db_path`.
    ///
    /// Returns `None` if another process owns it.
    pub fn try_acquire(db_path: &Path) -> Result<Option<Self>> {
        let dir = lock_dir();
        fs::create_dir_all(&dir).with_context(|| {
            format!("failed to create runtime lock directory: {}", dir.display())
        })?;

        let path = dir.join(scoped_lock_filename(db_path));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open lock file: {}", path.display()))?;

        match lock_file_nonblocking(&file) {
            Ok(()) => {
                // owner info for debugging
                let _ = file.set_len(0);
                let _ = file.seek(SeekFrom::Start(0));
                let _ = writeln!(file, "pid={}", std::process::id());
                let _ = file.flush();
                Ok(Some(Self { file }))
            }
            Err(e) if is_lock_busy(&e) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to lock file: {}", path.display())),
        }
    }
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
    }
}

fn lock_dir() -> PathBuf {
    let mut dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    };
    dir.push("beacon");
    dir
}

fn scoped_lock_filename(db_path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    db_path.to_string_lossy().hash(&mut hasher);
    format!("{QUEUE_LOCK_FILE}.{:016x}", hasher.finish())
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock)
        || matches!(error.raw_os_error(), Some(11) | Some(35))
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    const LOCK_UN: i32 = 8;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
compile_error!("beacon process locks currently require Unix (macOS/Linux)");
