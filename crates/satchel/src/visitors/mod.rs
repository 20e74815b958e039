//! AST visitors used by the payload builder.

mod import_scanner;

pub use import_scanner::{ImportPrefixes, ImportScanner, ScanError};
