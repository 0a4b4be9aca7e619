//! Advisory locks shared between threads and processes
//!
//! A lock is a file under `/tmp` that is `flock`ed while held. Threads of the same
//! process first serialize on an in-process lock keyed by the file path, so only one
//! of them ever contends on the file.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
};

use fs2::FileExt;
use lazy_static::lazy_static;
use thiserror::Error;
use tracing::{debug, trace};

use crate::error::SdkError;

pub const LOCK_DIR: &str = "/tmp";
pub const SDK_LOCK_SCOPE: &str = "com.pi-top.sdk";

lazy_static! {
    static ref THREAD_LOCKS: Mutex<HashMap<PathBuf, Arc<ThreadLock>>> = Mutex::new(HashMap::new());
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("Lock {0} is held by another holder")]
    Contended(String),
}

impl From<LockError> for SdkError {
    fn from(value: LockError) -> Self {
        match value {
            LockError::Io(err) => SdkError::Bus(err.to_string()),
            LockError::Contended(id) => SdkError::Contention(id),
        }
    }
}

/// Binary semaphore that isn't tied to a guard's lifetime
#[derive(Default)]
struct ThreadLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl ThreadLock {
    fn lock(&self) {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while *held {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *held = true;
    }

    fn try_lock(&self) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *held {
            false
        } else {
            *held = true;
            true
        }
    }

    fn unlock(&self) {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *held = false;
        self.released.notify_one();
    }
}

#[derive(Debug)]
pub struct AdvisoryLock {
    id: String,
    path: PathBuf,
    file: File,
    thread_lock: Arc<ThreadLock>,
    locked_by_self: AtomicBool,
}

impl std::fmt::Debug for ThreadLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadLock").finish_non_exhaustive()
    }
}

impl AdvisoryLock {
    /// Lock at `/tmp/.com.pi-top.sdk.<id>.lock`
    pub fn new(id: &str) -> Result<Self, LockError> {
        Self::in_dir(LOCK_DIR, id)
    }

    pub fn in_dir(dir: impl AsRef<Path>, id: &str) -> Result<Self, LockError> {
        let path = dir.as_ref().join(format!(".{SDK_LOCK_SCOPE}.{id}.lock"));
        Self::at(path, id)
    }

    /// Lock backed by an explicit path, used for locks shared with other programs
    #[tracing::instrument]
    pub fn at(path: PathBuf, id: &str) -> Result<Self, LockError> {
        trace!("AdvisoryLock::at()");

        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        if !existed {
            // Other users need to be able to take the lock too
            file.set_permissions(std::fs::Permissions::from_mode(0o666))?;
        }

        let thread_lock = {
            let mut locks = THREAD_LOCKS
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(path.clone()).or_default().clone()
        };

        Ok(Self {
            id: id.to_owned(),
            path,
            file,
            thread_lock,
            locked_by_self: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until the lock is held by this handle
    pub fn acquire(&self) -> Result<(), LockError> {
        debug!("Acquiring lock {}", self.id);

        self.thread_lock.lock();
        if let Err(err) = self.file.lock_exclusive() {
            self.thread_lock.unlock();
            return Err(err.into());
        }
        self.locked_by_self.store(true, Ordering::Release);

        debug!("Acquired lock {}", self.id);
        Ok(())
    }

    /// Takes the lock if nobody else holds it
    pub fn try_acquire(&self) -> Result<(), LockError> {
        if !self.thread_lock.try_lock() {
            return Err(LockError::Contended(self.id.clone()));
        }

        match self.file.try_lock_exclusive() {
            Ok(()) => {
                self.locked_by_self.store(true, Ordering::Release);
                debug!("Acquired lock {}", self.id);
                Ok(())
            }
            Err(err) => {
                self.thread_lock.unlock();
                if err.kind() == fs2::lock_contended_error().kind() {
                    Err(LockError::Contended(self.id.clone()))
                } else {
                    Err(err.into())
                }
            }
        }
    }

    pub fn release(&self) -> Result<(), LockError> {
        if !self.locked_by_self.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let res = self.file.unlock();
        self.thread_lock.unlock();
        debug!("Released lock {}", self.id);

        res.map_err(Into::into)
    }

    pub fn is_locked_by_self(&self) -> bool {
        self.locked_by_self.load(Ordering::Acquire)
    }

    /// True if this handle or anyone else holds the lock
    pub fn is_locked(&self) -> Result<bool, LockError> {
        if self.is_locked_by_self() {
            return Ok(true);
        }

        match self.file.try_lock_exclusive() {
            Ok(()) => {
                self.file.unlock()?;
                Ok(false)
            }
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(true),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::error!("Could not release lock {}: {err:?}", self.id);
        }

        // Handles are only cloned and dropped under the table lock, so the count is exact
        let mut locks = THREAD_LOCKS
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(std::mem::take(&mut self.thread_lock));
        if locks
            .get(&self.path)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.path);
        }
    }
}
