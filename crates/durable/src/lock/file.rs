//! Advisory file locks
//!
//! One `<namespace>.<task_id>.lock` file per task in a lock directory,
//! locked with `flock`-style exclusive locks. The OS drops the lock when
//! the holding process dies, so a crashed runner never wedges a task.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::Mutex;
use tracing::debug;

use super::{LockError, LockScope, TaskLock};

/// Lock provider backed by files in `dir`
///
/// Lock files are left in place after release; deleting a lock file that
/// another process has open would let two runners lock different inodes.
/// A released file is emptied, so an empty file means nobody holds it.
pub struct FileLockProvider {
    dir: PathBuf,
    held: Mutex<HashMap<LockScope, File>>,
}

impl FileLockProvider {
    /// Use `dir` for lock files, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, LockError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            held: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the lock file for `scope`
    pub fn lock_path(&self, scope: &LockScope) -> PathBuf {
        self.dir.join(format!("{}.lock", scope))
    }

    fn open(&self, scope: &LockScope) -> Result<File, LockError> {
        // Never truncate before holding the lock: the holder's pid lives here
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path(scope))?)
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl TaskLock for FileLockProvider {
    fn try_acquire(&self, scope: &LockScope) -> Result<bool, LockError> {
        let mut held = self.held.lock();
        if held.contains_key(scope) {
            return Ok(false);
        }

        let mut file = self.open(scope)?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!(%scope, "task lock acquired");
        held.insert(scope.clone(), file);
        Ok(true)
    }

    fn release(&self, scope: &LockScope) -> Result<(), LockError> {
        let Some(file) = self.held.lock().remove(scope) else {
            return Ok(());
        };
        file.set_len(0)?;
        file.unlock()?;
        debug!(%scope, "task lock released");
        Ok(())
    }

    fn is_held(&self, scope: &LockScope) -> Result<bool, LockError> {
        if self.held.lock().contains_key(scope) {
            return Ok(true);
        }
        let owner = match std::fs::read_to_string(self.lock_path(scope)) {
            Ok(owner) => owner,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if owner.trim().is_empty() {
            return Ok(false);
        }

        // A pid is recorded: either a live holder or one that died. The
        // check takes the lock for an instant, and a runner starting in
        // that window reports the task as already running.
        let file = self.open(scope)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                file.unlock()?;
                Ok(false)
            }
            Err(e) if is_contended(&e) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}
