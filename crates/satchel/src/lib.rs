//! Satchel packs a Python module together with the helper modules it
//! imports into a single self-extracting payload for remote execution.
//!
//! The entry point is [`PayloadBuilder`]: it classifies the module source,
//! computes the transitive helper closure for modern modules, caches the
//! resulting archive on disk and wraps it in a loader script.

pub mod archive;
pub mod args;
pub mod assembler;
pub mod bootstrap;
pub mod cache;
pub mod closure;
pub mod config;
pub mod error;
pub mod interpreter;
pub mod lock;
pub mod module_name;
pub mod orchestrator;
pub mod source_store;
pub mod substyle;
pub mod templar;
pub mod types;
pub mod visitors;

pub use error::{BuildError, Result};
pub use module_name::ModuleName;
pub use orchestrator::{ModulePayloadRequest, Payload, PayloadBuilder};
pub use types::{Compression, DispatchStyle, ExecutionStyle};
