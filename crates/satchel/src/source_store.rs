//! Locating helper module sources.
//!
//! Two origins are supported: the core helper trees on disk, searched like a
//! Python import path, and helpers shipped inside distributed packages, read
//! through a [`PackageData`] provider.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use log::{debug, trace, warn};
use thiserror::Error;

use crate::module_name::{ModuleName, PACKAGE_MARKER, SOURCE_EXTENSION};

/// Number of leading segments naming a distributed package
/// (`ansible_collections.<namespace>.<collection>`).
pub const DISTRIBUTION_DEPTH: usize = 3;

#[derive(Debug, Error)]
#[error("failed to read {}: {source}", .path.display())]
pub struct LookupError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Raw bytes of a located module, before it is given a closure identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedSource {
    pub source: Vec<u8>,
    pub origin: String,
    /// Found as `name/__init__.py` rather than `name.py`
    pub is_package: bool,
}

/// One resolved module. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    pub name: ModuleName,
    pub source: Vec<u8>,
    pub origin: String,
    pub is_package: bool,
}

impl SourceUnit {
    pub fn new(name: ModuleName, located: LocatedSource) -> Self {
        Self {
            name,
            source: located.source,
            origin: located.origin,
            is_package: located.is_package,
        }
    }

    /// A unit that does not come from any helper tree.
    pub fn synthetic(name: ModuleName, source: impl Into<Vec<u8>>, origin: &str) -> Self {
        Self {
            name,
            source: source.into(),
            origin: origin.to_owned(),
            is_package: true,
        }
    }
}

/// Resource lookup inside distributed packages.
///
/// `package` is a dotted distribution name and `resource` a `/`-separated
/// path inside it. `Ok(None)` means the package or the resource does not
/// exist; only genuine read failures are errors.
pub trait PackageData: fmt::Debug + Send + Sync {
    fn get_data(&self, package: &ModuleName, resource: &str) -> Result<Option<Vec<u8>>, LookupError>;
}

/// [`PackageData`] over collection roots laid out as
/// `<root>/ansible_collections/<namespace>/<collection>/...`.
#[derive(Debug, Clone, Default)]
pub struct FsPackageData {
    roots: Vec<PathBuf>,
}

impl FsPackageData {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }
}

impl PackageData for FsPackageData {
    fn get_data(&self, package: &ModuleName, resource: &str) -> Result<Option<Vec<u8>>, LookupError> {
        for root in &self.roots {
            let package_dir = package
                .segments()
                .iter()
                .fold(root.clone(), |path, part| path.join(part));
            if !package_dir.is_dir() {
                continue;
            }
            let path = resource
                .split('/')
                .fold(package_dir, |path, part| path.join(part));
            if let Some(bytes) = read_if_file(&path)? {
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }
}

fn read_if_file(path: &Path) -> Result<Option<Vec<u8>>, LookupError> {
    if !path.is_file() {
        return Ok(None);
    }
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        // Raced with a removal; treat like any other absent candidate
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(LookupError {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[derive(Debug)]
pub struct SourceStore {
    /// Roots of the core helper tree; each maps onto the helper namespace
    helper_paths: Vec<PathBuf>,
    packages: Box<dyn PackageData>,
}

impl SourceStore {
    pub fn new(helper_paths: Vec<PathBuf>, packages: Box<dyn PackageData>) -> Self {
        let helper_paths = helper_paths
            .into_iter()
            .map(canonicalize_path)
            .collect();
        Self {
            helper_paths,
            packages,
        }
    }

    pub fn with_helper_paths(helper_paths: Vec<PathBuf>) -> Self {
        Self::new(helper_paths, Box::new(FsPackageData::default()))
    }

    pub fn helper_paths(&self) -> &[PathBuf] {
        &self.helper_paths
    }

    /// Directories to search for a module whose parent package, relative to
    /// the helper namespace, is `package`.
    pub fn helper_dirs(&self, package: &[String]) -> Vec<PathBuf> {
        self.helper_paths
            .iter()
            .map(|root| package.iter().fold(root.clone(), |path, part| path.join(part)))
            .collect()
    }

    /// Find `simple_name` in `search_dirs`, first directory wins.
    ///
    /// Within one directory a package (`name/__init__.py`) is preferred over
    /// a module file (`name.py`), matching Python's own lookup order.
    pub fn resolve(
        &self,
        simple_name: &str,
        search_dirs: &[PathBuf],
    ) -> Result<Option<LocatedSource>, LookupError> {
        let package_file = format!("{PACKAGE_MARKER}.{SOURCE_EXTENSION}");
        let module_file = format!("{simple_name}.{SOURCE_EXTENSION}");

        for dir in search_dirs {
            let package_init = dir.join(simple_name).join(&package_file);
            if let Some(source) = read_if_file(&package_init)? {
                debug!("Found package at: {package_init:?}");
                return Ok(Some(LocatedSource {
                    source,
                    origin: canonicalize_path(package_init).display().to_string(),
                    is_package: true,
                }));
            }

            let module_path = dir.join(&module_file);
            if let Some(source) = read_if_file(&module_path)? {
                debug!("Found module file at: {module_path:?}");
                return Ok(Some(LocatedSource {
                    source,
                    origin: canonicalize_path(module_path).display().to_string(),
                    is_package: false,
                }));
            }
        }

        trace!("'{simple_name}' not found in {} directories", search_dirs.len());
        Ok(None)
    }

    /// Find `simple_name` as a child of one of `candidate_prefixes` inside a
    /// distributed package. Returns the full name of the first hit.
    ///
    /// A candidate naming a package that is not installed is skipped; the
    /// lookup only comes back empty once every candidate has been tried.
    pub fn resolve_packaged(
        &self,
        simple_name: &str,
        candidate_prefixes: &[ModuleName],
    ) -> Result<Option<(ModuleName, LocatedSource)>, LookupError> {
        for prefix in candidate_prefixes {
            let Some(distribution) = prefix.prefix(DISTRIBUTION_DEPTH) else {
                debug!("'{prefix}' is too short to name a distributed package; skipping");
                continue;
            };
            let resource_dir = prefix.segments()[DISTRIBUTION_DEPTH..].join("/");
            let join = |leaf: &str| {
                if resource_dir.is_empty() {
                    leaf.to_owned()
                } else {
                    format!("{resource_dir}/{leaf}")
                }
            };

            let package_resource = join(&format!("{simple_name}/{PACKAGE_MARKER}.{SOURCE_EXTENSION}"));
            if let Some(source) = self.packages.get_data(&distribution, &package_resource)? {
                return Ok(Some((
                    prefix.child(simple_name),
                    LocatedSource {
                        source,
                        origin: format!("{distribution}:{package_resource}"),
                        is_package: true,
                    },
                )));
            }

            let module_resource = join(&format!("{simple_name}.{SOURCE_EXTENSION}"));
            if let Some(source) = self.packages.get_data(&distribution, &module_resource)? {
                return Ok(Some((
                    prefix.child(simple_name),
                    LocatedSource {
                        source,
                        origin: format!("{distribution}:{module_resource}"),
                        is_package: false,
                    },
                )));
            }
        }
        Ok(None)
    }
}

/// Canonicalize a path, falling back to the original on failure
fn canonicalize_path(path: PathBuf) -> PathBuf {
    match path.canonicalize() {
        Ok(canonical) => canonical,
        Err(e) => {
            if path.exists() {
                warn!("Failed to canonicalize path {}: {}", path.display(), e);
            }
            path
        }
    }
}
