//! Wrapping a packed helper archive into an executable loader.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use log::debug;

use crate::{
    args::{ModuleArgs, envelope_json},
    bootstrap::{Coverage, LoaderContext, python_string_literal, render_loader},
    error::{BuildError, Result},
    module_name::ModuleName,
    source_store::SourceUnit,
    types::ExecutionStyle,
};

/// Per-host settings for one dispatch, already rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchParams {
    /// Interpreter line of the loader, `#!` included
    pub shebang: String,
    pub rlimit_nofile: Option<u64>,
    pub coverage: Coverage,
    /// Archive entry date; also written into the loader
    pub timestamp: DateTime<Utc>,
    pub keep_comments: bool,
}

/// Final payload handed to the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub bytes: Vec<u8>,
    pub style: ExecutionStyle,
    pub shebang: String,
}

#[derive(Debug, Clone)]
pub struct BundleAssembler {
    helper_namespace: ModuleName,
}

impl BundleAssembler {
    pub fn new(helper_namespace: ModuleName) -> Self {
        Self { helper_namespace }
    }

    /// Render the loader for `target` around an already-built archive.
    ///
    /// Identical inputs, including the timestamp, give identical bytes.
    pub fn assemble(
        &self,
        target: &SourceUnit,
        archive: &[u8],
        args: &ModuleArgs,
        params: &DispatchParams,
    ) -> Result<Bundle> {
        let json = envelope_json(args).map_err(|source| BuildError::NonSerializableArguments {
            target: target.name.dotted(),
            source,
        })?;
        let zipdata = STANDARD.encode(archive);
        let params_literal = python_string_literal(&json);
        let module_fqn = target.name.dotted();
        let helper_namespace = self.helper_namespace.dotted();

        let loader = render_loader(&LoaderContext {
            shebang: &params.shebang,
            module_name: target.name.last().unwrap_or_default(),
            module_fqn: &module_fqn,
            helper_namespace: &helper_namespace,
            params_literal: &params_literal,
            zipdata: &zipdata,
            rlimit_nofile: params.rlimit_nofile,
            coverage: &params.coverage,
            timestamp: params.timestamp,
            keep_comments: params.keep_comments,
        });
        debug!(
            "Assembled loader for {module_fqn}: {} byte archive, {} byte loader",
            archive.len(),
            loader.len()
        );

        Ok(Bundle {
            bytes: loader.into_bytes(),
            style: ExecutionStyle::NewPacked,
            shebang: params.shebang.clone(),
        })
    }
}
