//! Named build locks shared between worker processes.
//!
//! Each lock is an exclusive advisory lock on a file under
//! `{dir}/.locks/`. Module-specific locks are registered up front by whoever
//! schedules the workers; a build for a module without its own lock
//! serializes on the shared [`GENERIC_LOCK`] instead.

use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
};

use indexmap::IndexSet;
use log::{debug, warn};

use crate::{
    error::{BuildError, Result},
    module_name::ModuleName,
};

/// Lock used for modules nobody registered a lock for.
pub const GENERIC_LOCK: &str = "generic";

const LOCKS_DIR: &str = ".locks";

#[derive(Debug, Clone)]
pub struct LockRegistry {
    dir: PathBuf,
    names: IndexSet<String>,
}

impl LockRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            names: IndexSet::new(),
        }
    }

    pub fn with_locks<I, S>(dir: impl Into<PathBuf>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut registry = Self::new(dir);
        for name in names {
            registry.register(name);
        }
        registry
    }

    pub fn register(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.dir.join(LOCKS_DIR)
    }

    /// The lock a build of `module_name` serializes on.
    pub fn lock_name_for<'a>(&'a self, module_name: &'a str) -> &'a str {
        if self.is_registered(module_name) {
            module_name
        } else {
            GENERIC_LOCK
        }
    }

    /// Block until the lock for `module_name` is held.
    ///
    /// There is no timeout; a waiter stays blocked for as long as another
    /// worker is building under the same lock.
    pub fn acquire(&self, target: &ModuleName, module_name: &str) -> Result<NamedLock> {
        let name = self.lock_name_for(module_name);
        if name == GENERIC_LOCK {
            debug!("Using generic lock for {module_name}");
        } else {
            debug!("Using lock for {module_name}");
        }
        NamedLock::acquire(&self.lock_dir(), name).map_err(|source| BuildError::LockAcquisition {
            target: target.dotted(),
            lock: name.to_owned(),
            source,
        })
    }
}

/// A held lock, released on drop.
#[derive(Debug)]
pub struct NamedLock {
    file: File,
    path: PathBuf,
}

impl NamedLock {
    fn acquire(locks_dir: &Path, name: &str) -> std::io::Result<Self> {
        fs::create_dir_all(locks_dir)?;
        let path = locks_dir.join(format!("{name}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        fs4::fs_std::FileExt::lock_exclusive(&file)?;
        debug!("Lock acquired: {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        if let Err(e) = fs4::fs_std::FileExt::unlock(&self.file) {
            warn!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}
