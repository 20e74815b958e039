//! Configuration loading.
//!
//! Sources, lowest precedence first: built-in defaults, the first config file
//! found (an explicit path, `satchel.toml` in the working directory, or
//! `satchel/config.toml` in the user config directory), then the
//! `SATCHEL_CACHE_DIR` and `SATCHEL_HELPER_PATH` environment variables.
//! Command-line flags are applied on top by the binary.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use etcetera::BaseStrategy;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    bootstrap::Coverage,
    cache::BuildCache,
    closure::{CompatShim, HelperLayout},
    interpreter::DEFAULT_INTERPRETER,
    lock::LockRegistry,
    module_name::ModuleName,
    orchestrator::BuildSettings,
    source_store::{FsPackageData, SourceStore},
    substyle::LegacySubstitutions,
    types::Compression,
};

pub const CONFIG_FILE_NAME: &str = "satchel.toml";
pub const CACHE_DIR_ENV: &str = "SATCHEL_CACHE_DIR";
pub const HELPER_PATH_ENV: &str = "SATCHEL_HELPER_PATH";
pub const COVERAGE_CONFIG_ENV: &str = "_ANSIBLE_COVERAGE_CONFIG";
pub const COVERAGE_OUTPUT_ENV: &str = "_ANSIBLE_COVERAGE_OUTPUT";

const APP_DIR: &str = "satchel";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Dotted name of the core helper namespace
    pub helper_namespace: String,
    /// Directories whose contents are the helper namespace's children
    pub helper_paths: Vec<PathBuf>,
    /// Root namespace of distributed helper packages
    pub external_namespace: String,
    /// Directories containing `<external_namespace>/<ns>/<coll>/...`
    pub collection_paths: Vec<PathBuf>,
    pub compat_shim: Option<CompatShim>,
    pub cache_dir: Option<PathBuf>,
    pub default_interpreter: String,
    pub compression: Compression,
    pub rlimit_nofile: Option<u64>,
    pub selinux_special_fs: Vec<String>,
    pub syslog_facility: String,
    /// Version string substituted into legacy modules
    pub version: String,
    /// Keep comments in generated loaders
    pub keep_remote_files: bool,
    /// Modules with a build lock of their own
    pub module_locks: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let legacy = LegacySubstitutions::default();
        Self {
            helper_namespace: "ansible.module_utils".to_owned(),
            helper_paths: Vec::new(),
            external_namespace: "ansible_collections".to_owned(),
            collection_paths: Vec::new(),
            compat_shim: Some(CompatShim::default()),
            cache_dir: None,
            default_interpreter: DEFAULT_INTERPRETER.to_owned(),
            compression: Compression::default(),
            rlimit_nofile: None,
            selinux_special_fs: legacy.selinux_special_fs,
            syslog_facility: legacy.syslog_facility,
            version: legacy.version,
            keep_remote_files: false,
            module_locks: Vec::new(),
        }
    }
}

impl Config {
    /// Load from the first config file found, then apply the environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match Self::find_config_file(explicit)? {
            Some(path) => Self::from_file(&path)?,
            None => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading config from {}", path.display());
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn find_config_file(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if !path.is_file() {
                anyhow::bail!("Config file {} does not exist", path.display());
            }
            return Ok(Some(path.to_path_buf()));
        }

        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.is_file() {
            return Ok(Some(local));
        }

        Ok(user_config_file().filter(|path| path.is_file()))
    }

    pub fn apply_env(&mut self) {
        if let Some(dir) = env::var_os(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
            debug!("Using cache directory from {CACHE_DIR_ENV}");
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(paths) = env::var_os(HELPER_PATH_ENV).filter(|v| !v.is_empty()) {
            debug!("Prepending helper paths from {HELPER_PATH_ENV}");
            let mut helper_paths: Vec<PathBuf> = env::split_paths(&paths).collect();
            helper_paths.append(&mut self.helper_paths);
            self.helper_paths = helper_paths;
        }
    }

    /// Building needs at least one helper tree to find `basic` in.
    pub fn require_helper_paths(&self) -> Result<()> {
        if self.helper_paths.is_empty() {
            anyhow::bail!(
                "No helper directories configured: set `helper_paths` in {CONFIG_FILE_NAME} \
                 or list them in {HELPER_PATH_ENV}"
            );
        }
        Ok(())
    }

    /// Configured cache directory, else the user cache directory, else a
    /// directory under the system temp dir.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        etcetera::choose_base_strategy().map_or_else(
            |_| env::temp_dir().join(APP_DIR),
            |strategy| strategy.cache_dir().join(APP_DIR),
        )
    }

    pub fn layout(&self) -> HelperLayout {
        HelperLayout {
            core: ModuleName::parse(&self.helper_namespace),
            external: ModuleName::parse(&self.external_namespace),
            shim: self.compat_shim.clone(),
        }
    }

    pub fn source_store(&self) -> SourceStore {
        SourceStore::new(
            self.helper_paths.clone(),
            Box::new(FsPackageData::new(self.collection_paths.clone())),
        )
    }

    pub fn build_cache(&self) -> BuildCache {
        let dir = self.resolved_cache_dir();
        let locks = LockRegistry::with_locks(dir.clone(), self.module_locks.iter().cloned());
        BuildCache::new(dir, locks)
    }

    pub fn build_settings(&self, coverage: Coverage) -> BuildSettings {
        BuildSettings {
            default_interpreter: self.default_interpreter.clone(),
            compression: self.compression,
            rlimit_nofile: self.rlimit_nofile.filter(|limit| *limit > 0),
            legacy: LegacySubstitutions {
                version: self.version.clone(),
                selinux_special_fs: self.selinux_special_fs.clone(),
                syslog_facility: self.syslog_facility.clone(),
            },
            coverage,
            keep_comments: self.keep_remote_files,
            ..BuildSettings::new(self.layout())
        }
    }
}

fn user_config_file() -> Option<PathBuf> {
    let strategy = etcetera::choose_base_strategy().ok()?;
    Some(strategy.config_dir().join(APP_DIR).join("config.toml"))
}

/// Coverage toggles of the current process environment.
pub fn coverage_from_env() -> Coverage {
    let config = env::var(COVERAGE_CONFIG_ENV).ok();
    let output = env::var(COVERAGE_OUTPUT_ENV).ok();
    Coverage::from_toggles(config.as_deref(), output.as_deref())
}

/// A scoped guard that sets an environment variable and restores its
/// previous value when dropped, even if a test panics.
///
/// # Example
///
/// ```rust
/// use satchel::config::EnvVarGuard;
/// let _guard = EnvVarGuard::set("SATCHEL_CACHE_DIR", "/tmp/satchel-cache");
/// // SATCHEL_CACHE_DIR is restored when _guard goes out of scope
/// ```
#[must_use = "EnvVarGuard must be held in scope to ensure cleanup"]
#[derive(Debug)]
pub struct EnvVarGuard {
    key: &'static str,
    original_value: Option<String>,
}

impl EnvVarGuard {
    pub fn set(key: &'static str, value: &str) -> Self {
        let original_value = env::var(key).ok();

        // SAFETY: only used by tests that serialize access to the environment
        unsafe {
            env::set_var(key, value);
        }

        Self {
            key,
            original_value,
        }
    }

    pub fn unset(key: &'static str) -> Self {
        let original_value = env::var(key).ok();

        // SAFETY: only used by tests that serialize access to the environment
        unsafe {
            env::remove_var(key);
        }

        Self {
            key,
            original_value,
        }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        // catch_unwind keeps a failing restore from turning into a double panic
        #[allow(clippy::disallowed_methods)]
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            // SAFETY: restores the environment to its state before the guard
            unsafe {
                match self.original_value.take() {
                    Some(original) => env::set_var(self.key, original),
                    None => env::remove_var(self.key),
                }
            }
        }));
    }
}
