//! Per-scope advisory file locks.
//!
//! Structural mutations (insert, move, deactivate, provisioning) take an
//! exclusive lock on the scope because they may shift an unbounded number of
//! interval bounds; counter mutations, reconciliation, and verification take
//! a shared lock and run concurrently with each other. Lock files live under
//! `<data_dir>/locks/`, one per scope.

use crate::error::ErrorCode;
use crate::scope::Scope;
use fs2::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

/// Advisory lock errors. A timeout is the caller-visible concurrency
/// conflict; callers are expected to retry with backoff.
#[derive(Debug)]
pub enum LockError {
    Contended { scope: Scope, waited: Duration },
    IoError(io::Error),
}

impl From<io::Error> for LockError {
    fn from(err: io::Error) -> Self {
        Self::IoError(err)
    }
}

impl LockError {
    /// Machine-readable code associated with this lock error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Contended { .. } => ErrorCode::LockContention,
            Self::IoError(_) => ErrorCode::StorageFailure,
        }
    }

    /// Optional remediation hint for operators and agents.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Contended { scope, waited } => {
                write!(
                    f,
                    "{}: scope '{scope}' lock contended after {waited:?}",
                    self.code().code()
                )
            }
            Self::IoError(err) => write!(f, "{}: {}", self.code().code(), err),
        }
    }
}

impl std::error::Error for LockError {}

#[derive(Clone, Copy)]
enum LockKind {
    Shared,
    Exclusive,
}

#[derive(Debug)]
struct FileGuard {
    file: File,
    path: PathBuf,
}

impl FileGuard {
    fn acquire(
        locks_dir: &Path,
        scope: &Scope,
        timeout: Duration,
        kind: LockKind,
    ) -> Result<Self, LockError> {
        fs::create_dir_all(locks_dir)?;
        let path = locks_dir.join(scope.lock_file_name());

        let start = Instant::now();
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;

            let contended = match kind {
                LockKind::Shared => file.try_lock_shared().is_err(),
                LockKind::Exclusive => file.try_lock_exclusive().is_err(),
            };

            if !contended {
                return Ok(Self { file, path });
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Contended {
                    scope: scope.clone(),
                    waited: start.elapsed(),
                });
            }

            thread::sleep(Duration::from_millis(10));
        }
    }

    fn release(self) {
        let _ = self.file.unlock();
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// RAII guard for a scope's exclusive structural-write lock.
#[derive(Debug)]
pub struct ScopeWriteLock {
    guard: FileGuard,
}

impl ScopeWriteLock {
    /// Acquire an exclusive advisory lock for the scope, polling up to
    /// `timeout`.
    pub fn acquire(locks_dir: &Path, scope: &Scope, timeout: Duration) -> Result<Self, LockError> {
        Ok(Self {
            guard: FileGuard::acquire(locks_dir, scope, timeout, LockKind::Exclusive)?,
        })
    }

    /// Explicitly release the lock. Release also happens automatically on drop.
    pub fn release(self) {
        self.guard.release();
    }

    /// Return the lock file path.
    pub fn path(&self) -> &Path {
        self.guard.path()
    }
}

/// RAII guard for a scope's shared counter/read lock.
#[derive(Debug)]
pub struct ScopeReadLock {
    guard: FileGuard,
}

impl ScopeReadLock {
    /// Acquire a shared advisory lock for the scope, polling up to `timeout`.
    pub fn acquire(locks_dir: &Path, scope: &Scope, timeout: Duration) -> Result<Self, LockError> {
        Ok(Self {
            guard: FileGuard::acquire(locks_dir, scope, timeout, LockKind::Shared)?,
        })
    }

    /// Explicitly release the lock. Release also happens automatically on drop.
    pub fn release(self) {
        self.guard.release();
    }

    /// Return the lock file path.
    pub fn path(&self) -> &Path {
        self.guard.path()
    }
}

#[cfg(test)]
mod tests {
    use super::{LockError, ScopeReadLock, ScopeWriteLock};
    use crate::error::ErrorCode;
    use crate::scope::Scope;
    use std::{
        path::PathBuf,
        sync::{Arc, Barrier},
        thread,
        time::Duration,
    };

    fn locks_dir(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push("canopy_lock_tests");
        path.push(name);
        path
    }

    fn scope() -> Scope {
        Scope::new("acme", "np").expect("valid scope")
    }

    #[test]
    fn write_lock_allows_acquire_and_release() -> Result<(), LockError> {
        let dir = locks_dir("basic");
        let lock = ScopeWriteLock::acquire(&dir, &scope(), Duration::from_millis(50))?;
        assert!(lock.path().ends_with("acme__np.lock"));
        lock.release();
        Ok(())
    }

    #[test]
    fn write_lock_times_out_when_held() {
        let dir = locks_dir("timeout");
        let _guard = ScopeWriteLock::acquire(&dir, &scope(), Duration::from_millis(50)).unwrap();
        let err = ScopeWriteLock::acquire(&dir, &scope(), Duration::from_millis(20)).unwrap_err();

        assert!(matches!(err, LockError::Contended { scope: s, .. } if s == scope()));
    }

    #[test]
    fn lock_error_maps_to_machine_code() {
        let contended = LockError::Contended {
            scope: scope(),
            waited: Duration::from_millis(10),
        };
        assert_eq!(contended.code(), ErrorCode::LockContention);
        assert!(contended.hint().is_some());
        assert!(contended.to_string().contains("acme/np"));
    }

    #[test]
    fn read_locks_are_compatible() -> Result<(), LockError> {
        let dir = locks_dir("read-share");
        let first = ScopeReadLock::acquire(&dir, &scope(), Duration::from_millis(50))?;
        let second = ScopeReadLock::acquire(&dir, &scope(), Duration::from_millis(50))?;

        first.release();
        second.release();
        Ok(())
    }

    #[test]
    fn writer_blocks_readers() {
        let dir = locks_dir("write-blocks-read");
        let _write = ScopeWriteLock::acquire(&dir, &scope(), Duration::from_millis(50)).unwrap();

        let started = std::time::Instant::now();
        let read = ScopeReadLock::acquire(&dir, &scope(), Duration::from_millis(20));

        assert!(matches!(read, Err(LockError::Contended { .. })));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn distinct_scopes_never_contend() -> Result<(), LockError> {
        let dir = locks_dir("scope-isolation");
        let other = Scope::new("acme", "in").expect("valid scope");

        let _a = ScopeWriteLock::acquire(&dir, &scope(), Duration::from_millis(50))?;
        let _b = ScopeWriteLock::acquire(&dir, &other, Duration::from_millis(50))?;
        Ok(())
    }

    #[test]
    fn lock_release_allows_follow_up_lock() -> Result<(), LockError> {
        let dir = locks_dir("release-followup");
        {
            let _first = ScopeWriteLock::acquire(&dir, &scope(), Duration::from_millis(50))?;
        }

        let _second = ScopeWriteLock::acquire(&dir, &scope(), Duration::from_millis(50))?;
        Ok(())
    }

    #[test]
    fn contention_is_resolved_after_writer_releases() -> Result<(), LockError> {
        let dir = locks_dir("thread");

        let blocker = Arc::new(Barrier::new(2));
        let waiter = Arc::new(Barrier::new(2));

        let blocker_thread = Arc::clone(&blocker);
        let waiter_thread = Arc::clone(&waiter);
        let dir_in_thread = dir.clone();
        let handle = thread::spawn(move || {
            let _writer =
                ScopeWriteLock::acquire(&dir_in_thread, &scope(), Duration::from_millis(200))
                    .unwrap();
            blocker_thread.wait();
            waiter_thread.wait();
        });

        blocker.wait();
        assert!(matches!(
            ScopeReadLock::acquire(&dir, &scope(), Duration::from_millis(20)),
            Err(LockError::Contended { .. })
        ));
        waiter.wait();
        handle.join().unwrap();

        let follow_up = ScopeWriteLock::acquire(&dir, &scope(), Duration::from_millis(50))?;
        follow_up.release();
        Ok(())
    }
}
