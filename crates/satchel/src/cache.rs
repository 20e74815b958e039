//! On-disk payload cache shared by concurrent workers.
//!
//! One file per `(module, compression)` pair, no index. A file is either
//! absent or complete: builders write to a `-part` file beside it and rename
//! it into place while holding the module's build lock. Readers never lock.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::{debug, info};

use crate::{
    error::{BuildError, Result},
    lock::LockRegistry,
    module_name::ModuleName,
    types::Compression,
};

const PART_SUFFIX: &str = "-part";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Short module name, as used for lock selection
    pub module_name: String,
    /// Fully qualified identity; names the cache file
    pub target: ModuleName,
    pub compression: Compression,
}

impl CacheKey {
    pub fn new(module_name: impl Into<String>, target: ModuleName, compression: Compression) -> Self {
        Self {
            module_name: module_name.into(),
            target,
            compression,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}-{}", self.target, self.compression)
    }
}

#[derive(Debug)]
pub struct BuildCache {
    dir: PathBuf,
    locks: LockRegistry,
}

impl BuildCache {
    pub fn new(dir: impl Into<PathBuf>, locks: LockRegistry) -> Self {
        Self {
            dir: dir.into(),
            locks,
        }
    }

    /// Cache entries and the lock directory share one root.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self::new(dir.clone(), LockRegistry::new(dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn artifact_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Return the cached artifact for `key`, running `build` to create it if
    /// no worker has yet.
    ///
    /// At most one build result is ever published per key, and every caller
    /// returns the published bytes, including the caller that built them.
    pub fn get_or_build<F>(&self, key: &CacheKey, build: F) -> Result<Vec<u8>>
    where
        F: FnOnce() -> Result<Vec<u8>>,
    {
        let path = self.artifact_path(key);
        if let Some(bytes) = read_artifact(&key.target, &path)? {
            debug!("Using cached payload: {}", path.display());
            return Ok(bytes);
        }

        {
            let _lock = self.locks.acquire(&key.target, &key.module_name)?;
            // Another worker may have published while we waited
            if path.is_file() {
                debug!("Payload for {} was built by another worker", key.target);
            } else {
                let bytes = build()?;
                self.publish(key, &path, &bytes)?;
                info!(
                    "Cached payload for {} ({} bytes) at {}",
                    key.target,
                    bytes.len(),
                    path.display()
                );
            }
        }

        read_artifact(&key.target, &path)?.ok_or_else(|| BuildError::CacheCorruption {
            target: key.target.dotted(),
            path,
        })
    }

    fn publish(&self, key: &CacheKey, path: &Path, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| BuildError::io(&key.target, &self.dir, e))?;
        let part = self.dir.join(format!("{}{PART_SUFFIX}", key.file_name()));
        fs::write(&part, bytes).map_err(|e| BuildError::io(&key.target, &part, e))?;
        fs::rename(&part, path).map_err(|e| BuildError::io(&key.target, path, e))
    }
}

fn read_artifact(target: &ModuleName, path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BuildError::io(target, path, e)),
    }
}
