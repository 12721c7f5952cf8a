//! Cross-process advisory lock guarding background sync.
//!
//! The lock file holds the decimal PID of the holder on its first line. The
//! OS-level exclusive lock is authoritative; the PID is only used to detect
//! holders that died without releasing.

use crate::error::Result;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default lock file name inside the agent directory.
pub const LOCK_FILENAME: &str = ".background_sync.lock";

#[derive(Debug)]
pub struct SyncLock {
    path: PathBuf,
    file: Option<File>,
}

impl SyncLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this instance currently holds the lock.
    pub fn is_acquired(&self) -> bool {
        self.file.is_some()
    }

    /// Try to take the lock without blocking.
    ///
    /// Returns `Ok(false)` when another holder has it. On success the file is
    /// truncated and rewritten with our PID.
    pub fn try_acquire(&mut self) -> Result<bool> {
        if self.file.is_some() {
            return Ok(true);
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        if file.try_lock_exclusive().is_err() {
            debug!(path = %self.path.display(), "Sync lock is held elsewhere");
            return Ok(false);
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        self.file = Some(file);
        Ok(true)
    }

    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
    }

    /// PID recorded in the lock file, if any.
    pub fn holder_pid(&self) -> Option<u32> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        contents.lines().next()?.trim().parse().ok()
    }

    /// True when some other open handle holds the lock and its recorded PID
    /// is alive.
    pub fn is_held_by_another_process(&self) -> bool {
        if self.file.is_some() || !self.path.exists() {
            return false;
        }
        if !self.is_locked_elsewhere() {
            return false;
        }
        match self.holder_pid() {
            Some(pid) => process_exists(pid),
            None => true,
        }
    }

    /// True when the lock file exists but nobody can be holding it: either
    /// the OS lock is free or the recorded PID is dead.
    pub fn is_stale(&self) -> bool {
        if self.file.is_some() || !self.path.exists() {
            return false;
        }
        if !self.is_locked_elsewhere() {
            return true;
        }
        self.holder_pid().is_some_and(|pid| !process_exists(pid))
    }

    /// Clear a stale lock file. Returns true when no stale holder remains.
    ///
    /// The file is truncated in place under the OS lock rather than unlinked,
    /// so every contender keeps locking the same inode.
    pub fn cleanup_stale(&self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(true);
        }
        if !self.is_stale() {
            return Ok(false);
        }
        let pid = self.holder_pid();
        let file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(err.into()),
        };
        if file.try_lock_exclusive().is_err() {
            debug!(path = %self.path.display(), "Sync lock taken before cleanup");
            return Ok(false);
        }
        info!(path = %self.path.display(), ?pid, "Clearing stale sync lock");
        let cleared = file.set_len(0);
        let _ = FileExt::unlock(&file);
        cleared?;
        Ok(true)
    }

    fn is_locked_elsewhere(&self) -> bool {
        let Ok(file) = OpenOptions::new().read(true).write(true).open(&self.path) else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        }
    }
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Check if a process exists by PID.
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks for existence; EPERM still means the process is alive.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_exists(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Above the kernel's pid_max, so never a live process.
    const DEAD_PID: u32 = 999_999_999;

    #[test]
    fn test_acquire_writes_pid() {
        let dir = TempDir::new().unwrap();
        let mut lock = SyncLock::new(dir.path().join("nested").join(LOCK_FILENAME));

        assert!(lock.try_acquire().unwrap());
        assert!(lock.is_acquired());
        assert_eq!(lock.holder_pid(), Some(std::process::id()));
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILENAME);
        let mut first = SyncLock::new(&path);
        let mut second = SyncLock::new(&path);

        assert!(first.try_acquire().unwrap());
        assert!(!second.try_acquire().unwrap());
        assert!(second.is_held_by_another_process());
        assert!(!second.is_stale());

        first.release();
        assert!(!second.is_held_by_another_process());
        assert!(second.try_acquire().unwrap());
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILENAME);
        {
            let mut lock = SyncLock::new(&path);
            assert!(lock.try_acquire().unwrap());
        }
        let mut again = SyncLock::new(&path);
        assert!(again.try_acquire().unwrap());
    }

    #[test]
    fn test_dead_pid_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILENAME);
        std::fs::write(&path, format!("{DEAD_PID}\n")).unwrap();

        let mut lock = SyncLock::new(&path);
        assert!(lock.is_stale());
        assert!(!lock.is_held_by_another_process());
        assert!(lock.try_acquire().unwrap());
        assert_eq!(lock.holder_pid(), Some(std::process::id()));
    }

    #[test]
    fn test_cleanup_stale() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILENAME);
        let lock = SyncLock::new(&path);
        assert!(lock.cleanup_stale().unwrap());

        std::fs::write(&path, format!("{DEAD_PID}\n")).unwrap();
        assert!(lock.cleanup_stale().unwrap());
        assert!(path.exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
        assert_eq!(lock.holder_pid(), None);

        let mut next = SyncLock::new(&path);
        assert!(next.try_acquire().unwrap());
    }

    #[test]
    fn test_cleanup_keeps_inode_for_waiting_contender() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILENAME);
        std::fs::write(&path, format!("{DEAD_PID}\n")).unwrap();

        // A contender that opened the file before cleanup still contends on
        // the same file afterwards.
        let early = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        assert!(SyncLock::new(&path).cleanup_stale().unwrap());
        early.try_lock_exclusive().unwrap();

        let mut late = SyncLock::new(&path);
        assert!(!late.try_acquire().unwrap());
        FileExt::unlock(&early).unwrap();
        assert!(late.try_acquire().unwrap());
    }

    #[test]
    fn test_cleanup_keeps_live_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILENAME);
        let mut holder = SyncLock::new(&path);
        assert!(holder.try_acquire().unwrap());

        let observer = SyncLock::new(&path);
        assert!(!observer.cleanup_stale().unwrap());
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_exists() {
        assert!(process_exists(std::process::id()));
        assert!(!process_exists(DEAD_PID));
        assert!(!process_exists(0));
    }
}
