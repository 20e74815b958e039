//! Errors surfaced by the payload builder.
//!
//! Every variant names the target module being packaged so that the calling
//! orchestration layer can report which module failed without extra context.

use std::path::PathBuf;

use thiserror::Error;

use crate::module_name::ModuleName;

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuildError {
    /// A module or helper could not be parsed as Python source.
    #[error("failed to parse {module} while packaging {target}: {message}")]
    Parse {
        target: String,
        module: String,
        message: String,
    },

    /// No interpretation of an import resolved against the helper trees.
    #[error(
        "could not find imported helper '{reference}' (imported by {importer}) while packaging \
         {target}; tried {}",
        .attempted.join(", ")
    )]
    UnresolvedDependency {
        target: String,
        importer: String,
        reference: String,
        attempted: Vec<String>,
    },

    #[error("arguments for {target} cannot be serialized as JSON: {source}")]
    NonSerializableArguments {
        target: String,
        #[source]
        source: serde_json::Error,
    },

    /// The artifact disappeared between publishing and reading it back.
    #[error(
        "payload cache entry {} for {target} vanished after it was built; another process is \
         modifying the cache directory",
        .path.display()
    )]
    CacheCorruption { target: String, path: PathBuf },

    #[error("failed to acquire build lock '{lock}' for {target}: {source}")]
    LockAcquisition {
        target: String,
        lock: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {} while packaging {target}: {source}", .path.display())]
    Io {
        target: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write payload archive for {target}: {source}")]
    Archive {
        target: String,
        #[source]
        source: zip::result::ZipError,
    },

    /// Zip entries cannot carry dates before 1980.
    #[error("cannot create payload archive for {target} with pre-1980 date {timestamp}")]
    InvalidTimestamp { target: String, timestamp: String },

    #[error("no wrapper generator is configured for shell-wrapped module {target}")]
    MissingWrapperGenerator { target: String },

    #[error("failed to render {what} for {target}: {message}")]
    Template {
        target: String,
        what: String,
        message: String,
    },

    #[error("unsupported module compression '{value}' for {target}")]
    InvalidCompression { target: String, value: String },
}

impl BuildError {
    pub(crate) fn io(target: &ModuleName, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            target: target.dotted(),
            path: path.into(),
            source,
        }
    }

    pub(crate) fn archive(target: &ModuleName, source: zip::result::ZipError) -> Self {
        Self::Archive {
            target: target.dotted(),
            source,
        }
    }

    /// Whether this failure came from the helper sources rather than the environment.
    pub fn is_source_error(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. } | Self::UnresolvedDependency { .. }
        )
    }
}
