//! Dotted module identities.
//!
//! A [`ModuleName`] is the key used by the closure builder, the scanner and the
//! archive writer. Segments are stored unjoined so that prefix tests and
//! ancestor walks never have to re-split strings.

use std::fmt;

use ruff_python_stdlib::identifiers::is_identifier;

/// Leaf segment that marks a package initializer rather than an importable module.
pub const PACKAGE_MARKER: &str = "__init__";

/// File extension used for every source entry in the archive.
pub const SOURCE_EXTENSION: &str = "py";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ModuleName {
    segments: Vec<String>,
}

impl ModuleName {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a dotted path, ignoring empty segments (`"a..b"` becomes `a.b`).
    pub fn parse(dotted: &str) -> Self {
        Self::new(dotted.split('.').filter(|s| !s.is_empty()))
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Whether every segment is a valid Python identifier.
    ///
    /// A star import (`from x import *`) produces a `*` leaf, which is the one
    /// non-identifier segment the scanner lets through.
    pub fn is_valid(&self) -> bool {
        !self.segments.is_empty() && self.segments.iter().all(|s| is_identifier(s))
    }

    pub fn is_package_marker(&self) -> bool {
        self.last() == Some(PACKAGE_MARKER)
    }

    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// The first `len` segments, or `None` if the name is shorter than that.
    pub fn prefix(&self, len: usize) -> Option<Self> {
        (len <= self.segments.len()).then(|| Self {
            segments: self.segments[..len].to_vec(),
        })
    }

    /// Drop the last `count` segments.
    pub fn drop_last(&self, count: usize) -> Option<Self> {
        self.segments
            .len()
            .checked_sub(count)
            .and_then(|len| self.prefix(len))
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            None
        } else {
            self.drop_last(1)
        }
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn join(&self, other: &Self) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// Segments after `prefix`, if this name is rooted at it.
    pub fn strip_prefix(&self, prefix: &Self) -> Option<&[String]> {
        self.segments.strip_prefix(prefix.segments.as_slice())
    }

    /// The initializer entry of this package: `a.b` becomes `a.b.__init__`.
    pub fn package_init(&self) -> Self {
        self.child(PACKAGE_MARKER)
    }

    /// The importable name, with a trailing `__init__` removed.
    pub fn without_marker(&self) -> Self {
        if self.is_package_marker() {
            self.drop_last(1).unwrap_or_default()
        } else {
            self.clone()
        }
    }

    /// Proper, non-empty prefixes, shortest first: `a.b.c` yields `a`, `a.b`.
    pub fn ancestors(&self) -> impl Iterator<Item = Self> + '_ {
        (1..self.segments.len()).map(|len| Self {
            segments: self.segments[..len].to_vec(),
        })
    }

    /// Path of this module inside the payload archive. Always `/`-separated.
    pub fn archive_path(&self) -> String {
        format!("{}.{SOURCE_EXTENSION}", self.segments.join("/"))
    }

    pub fn dotted(&self) -> String {
        self.segments.join(".")
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dotted())
    }
}

impl From<&str> for ModuleName {
    fn from(dotted: &str) -> Self {
        Self::parse(dotted)
    }
}
