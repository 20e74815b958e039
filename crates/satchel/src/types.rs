//! Shared type definitions for the satchel crate
//!
//! These enums are passed between the preprocessor, the assembler and the
//! cache, and are reported back to the transport layer.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a module source, decided once per build by sniffing.
///
/// The variant decides which parts of the pipeline run at all: only
/// [`DispatchStyle::ModernClosurePacked`] goes through closure building and
/// bundle assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchStyle {
    /// Non-text content, shipped untouched
    Binary,
    /// Legacy module taking a key=value arguments file; also the fallback
    /// when nothing else matches
    LegacyKeyValue,
    /// Module with a JSON-args placeholder that is substituted in place
    LegacyJsonArgs,
    /// Module that asks for its arguments as a JSON file
    LegacyWantJson,
    /// Module importing the helper namespace, packed with its closure
    ModernClosurePacked,
    /// Module handled by the non-scripting wrapper generator
    ModernShellWrapper,
}

impl DispatchStyle {
    /// How the transport layer should treat the produced bytes.
    pub fn execution_style(self) -> ExecutionStyle {
        match self {
            Self::Binary => ExecutionStyle::Binary,
            Self::ModernClosurePacked => ExecutionStyle::NewPacked,
            Self::ModernShellWrapper => ExecutionStyle::NewShell,
            Self::LegacyWantJson => ExecutionStyle::NonNativeWantJson,
            Self::LegacyKeyValue | Self::LegacyJsonArgs => ExecutionStyle::Old,
        }
    }
}

impl fmt::Display for DispatchStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Binary => "binary",
            Self::LegacyKeyValue => "legacy-key-value",
            Self::LegacyJsonArgs => "legacy-json-args",
            Self::LegacyWantJson => "legacy-want-json",
            Self::ModernClosurePacked => "modern-closure-packed",
            Self::ModernShellWrapper => "modern-shell-wrapper",
        };
        f.write_str(name)
    }
}

/// Execution style reported alongside the payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStyle {
    Old,
    NewPacked,
    NewShell,
    Binary,
    NonNativeWantJson,
}

impl fmt::Display for ExecutionStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Old => "old",
            Self::NewPacked => "new-packed",
            Self::NewShell => "new-shell",
            Self::Binary => "binary",
            Self::NonNativeWantJson => "non-native-want-json",
        };
        f.write_str(name)
    }
}

/// Compression applied to every entry of the payload archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Compression {
    #[serde(rename = "ZIP_STORED", alias = "stored")]
    Stored,
    #[default]
    #[serde(rename = "ZIP_DEFLATED", alias = "deflated")]
    Deflated,
}

impl Compression {
    /// Name used in cache file names.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stored => "ZIP_STORED",
            Self::Deflated => "ZIP_DEFLATED",
        }
    }

    pub(crate) fn method(self) -> zip::CompressionMethod {
        match self {
            Self::Stored => zip::CompressionMethod::Stored,
            Self::Deflated => zip::CompressionMethod::Deflated,
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown compression '{0}' (expected ZIP_STORED or ZIP_DEFLATED)")]
pub struct UnknownCompression(pub String);

impl FromStr for Compression {
    type Err = UnknownCompression;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ZIP_STORED" | "STORED" => Ok(Self::Stored),
            "ZIP_DEFLATED" | "DEFLATED" => Ok(Self::Deflated),
            _ => Err(UnknownCompression(s.to_owned())),
        }
    }
}
