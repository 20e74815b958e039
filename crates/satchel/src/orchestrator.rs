//! Top-level build entry point.
//!
//! A request is classified first. Binary, shell-wrapped and legacy modules
//! return early; modern modules go through the payload cache, the closure
//! builder and the loader.

use std::{fmt, path::Path};

use chrono::Utc;
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    archive::ArchiveWriter,
    args::ModuleArgs,
    assembler::{BundleAssembler, DispatchParams},
    bootstrap::Coverage,
    cache::{BuildCache, CacheKey},
    closure::{ClosureBuilder, HelperLayout},
    error::{BuildError, Result},
    interpreter::{DEFAULT_INTERPRETER, Shebang, rewrite_shebang},
    module_name::ModuleName,
    source_store::{LocatedSource, SourceStore, SourceUnit},
    substyle::{LegacySubstitutions, Preprocessed, SubstylePreprocessor},
    templar::{RenderError, VariableRenderer},
    types::{Compression, DispatchStyle, ExecutionStyle},
};

/// Variable selecting the archive compression when a request does not.
pub const COMPRESSION_VARIABLE: &str = "ansible_module_compression";
/// Variable overriding the configured open-file limit.
pub const RLIMIT_VARIABLE: &str = "ansible_python_module_rlimit_nofile";
/// Variable overriding the configured syslog facility of JSON-args modules.
pub const SYSLOG_FACILITY_VARIABLE: &str = "ansible_syslog_facility";

const SHELL_WRAPPER_SHEBANG: &str = "#!powershell";

static CORE_MODULE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/(?P<path>ansible/modules/.*)\.py$").expect("core module path pattern is valid")
});

static COLLECTION_MODULE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/(?P<path>ansible_collections/[^/]+/[^/]+/plugins/modules/.*)\.py$")
        .expect("collection module path pattern is valid")
});

/// Produces the payload of a module whose sources cannot be packed as
/// Python, such as shell-wrapped modules.
pub trait WrapperGenerator: fmt::Debug + Send + Sync {
    fn generate(&self, request: &ModulePayloadRequest<'_>, source: &[u8]) -> Result<Vec<u8>>;
}

pub struct ModulePayloadRequest<'a> {
    /// Short name, used for cache files and locks
    pub module_name: &'a str,
    /// Identity the module runs under on the remote host
    pub module_fqn: ModuleName,
    pub source: &'a [u8],
    pub args: &'a ModuleArgs,
    /// Pinned compression; otherwise taken from variables or settings
    pub compression: Option<Compression>,
    pub vars: &'a dyn VariableRenderer,
}

impl fmt::Debug for ModulePayloadRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModulePayloadRequest")
            .field("module_name", &self.module_name)
            .field("module_fqn", &self.module_fqn)
            .field("source_len", &self.source.len())
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub bytes: Vec<u8>,
    pub style: ExecutionStyle,
    pub shebang: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSettings {
    pub layout: HelperLayout,
    pub default_interpreter: String,
    pub compression: Compression,
    pub rlimit_nofile: Option<u64>,
    pub legacy: LegacySubstitutions,
    pub coverage: Coverage,
    pub keep_comments: bool,
    /// Fixed archive date; the current time when unset
    pub timestamp: Option<chrono::DateTime<Utc>>,
}

impl BuildSettings {
    pub fn new(layout: HelperLayout) -> Self {
        Self {
            layout,
            default_interpreter: DEFAULT_INTERPRETER.to_owned(),
            compression: Compression::default(),
            rlimit_nofile: None,
            legacy: LegacySubstitutions::default(),
            coverage: Coverage::Off,
            keep_comments: false,
            timestamp: None,
        }
    }
}

#[derive(Debug)]
pub struct PayloadBuilder {
    settings: BuildSettings,
    store: SourceStore,
    preprocessor: SubstylePreprocessor,
    assembler: BundleAssembler,
    cache: Option<BuildCache>,
    wrapper: Option<Box<dyn WrapperGenerator>>,
}

impl PayloadBuilder {
    pub fn new(settings: BuildSettings, store: SourceStore) -> std::result::Result<Self, regex::Error> {
        let preprocessor =
            SubstylePreprocessor::new(&settings.layout.core, &settings.layout.external)?;
        let assembler = BundleAssembler::new(settings.layout.core.clone());
        Ok(Self {
            settings,
            store,
            preprocessor,
            assembler,
            cache: None,
            wrapper: None,
        })
    }

    #[must_use]
    pub fn with_cache(mut self, cache: BuildCache) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_wrapper_generator(mut self, wrapper: Box<dyn WrapperGenerator>) -> Self {
        self.wrapper = Some(wrapper);
        self
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    pub fn classify(&self, source: &[u8]) -> DispatchStyle {
        self.preprocessor.classify(source)
    }

    pub fn build(&self, request: &ModulePayloadRequest<'_>) -> Result<Payload> {
        let target = &request.module_fqn;
        let legacy = self.legacy_substitutions(request.vars);
        let Preprocessed { style, source } = self
            .preprocessor
            .process(request.source, request.args, &legacy)
            .map_err(|source| BuildError::NonSerializableArguments {
                target: target.dotted(),
                source,
            })?;
        debug!("Module {target} classified as {style}");

        match style {
            DispatchStyle::Binary => Ok(Payload {
                bytes: source,
                style: style.execution_style(),
                shebang: None,
            }),
            DispatchStyle::ModernShellWrapper => {
                let wrapper =
                    self.wrapper
                        .as_ref()
                        .ok_or_else(|| BuildError::MissingWrapperGenerator {
                            target: target.dotted(),
                        })?;
                Ok(Payload {
                    bytes: wrapper.generate(request, &source)?,
                    style: style.execution_style(),
                    shebang: Some(SHELL_WRAPPER_SHEBANG.to_owned()),
                })
            }
            DispatchStyle::ModernClosurePacked => self.build_packed(request, source),
            DispatchStyle::LegacyKeyValue
            | DispatchStyle::LegacyJsonArgs
            | DispatchStyle::LegacyWantJson => {
                let (bytes, shebang) = rewrite_shebang(&source, request.vars)
                    .map_err(|e| template_error(target, "interpreter", &e))?;
                Ok(Payload {
                    bytes,
                    style: style.execution_style(),
                    shebang,
                })
            }
        }
    }

    fn build_packed(&self, request: &ModulePayloadRequest<'_>, source: Vec<u8>) -> Result<Payload> {
        let target_name = &request.module_fqn;
        let compression = self.compression(request)?;
        let timestamp = self.settings.timestamp.unwrap_or_else(Utc::now);
        let target = SourceUnit::new(
            target_name.clone(),
            LocatedSource {
                source,
                origin: request.module_name.to_owned(),
                is_package: false,
            },
        );

        let build_archive = || -> Result<Vec<u8>> {
            let mut out = ArchiveWriter::new(target_name, compression, timestamp)?;
            ClosureBuilder::new(&self.settings.layout, &self.store).build(&target, &mut out)?;
            out.finish()
        };
        let archive = match &self.cache {
            Some(cache) => {
                let key = CacheKey::new(request.module_name, target_name.clone(), compression);
                cache.get_or_build(&key, build_archive)?
            }
            None => build_archive()?,
        };

        // The loader runs under the configured interpreter, never the module's shebang.
        let shebang = Shebang::new(self.settings.default_interpreter.as_str())
            .resolve_or_self(request.vars)
            .map_err(|e| template_error(target_name, "interpreter", &e))?;
        let params = DispatchParams {
            shebang,
            rlimit_nofile: self.rlimit_nofile(target_name, request.vars)?,
            coverage: self.settings.coverage.clone(),
            timestamp,
            keep_comments: self.settings.keep_comments,
        };

        let bundle = self
            .assembler
            .assemble(&target, &archive, request.args, &params)?;
        info!("Built payload for {target_name} ({} bytes)", bundle.bytes.len());
        Ok(Payload {
            bytes: bundle.bytes,
            style: bundle.style,
            shebang: Some(bundle.shebang),
        })
    }

    fn compression(&self, request: &ModulePayloadRequest<'_>) -> Result<Compression> {
        if let Some(compression) = request.compression {
            return Ok(compression);
        }
        let Some(raw) = request.vars.get(COMPRESSION_VARIABLE) else {
            return Ok(self.settings.compression);
        };
        let target = &request.module_fqn;
        let value = request
            .vars
            .render(&raw)
            .map_err(|e| template_error(target, COMPRESSION_VARIABLE, &e))?;
        value.parse().map_err(|_| BuildError::InvalidCompression {
            target: target.dotted(),
            value,
        })
    }

    fn rlimit_nofile(
        &self,
        target: &ModuleName,
        vars: &dyn VariableRenderer,
    ) -> Result<Option<u64>> {
        let Some(raw) = vars.get(RLIMIT_VARIABLE) else {
            return Ok(self.settings.rlimit_nofile);
        };
        let value = vars
            .render(&raw)
            .map_err(|e| template_error(target, RLIMIT_VARIABLE, &e))?;
        let limit: u64 = value.trim().parse().map_err(|_| BuildError::Template {
            target: target.dotted(),
            what: RLIMIT_VARIABLE.to_owned(),
            message: format!("'{value}' is not a non-negative integer"),
        })?;
        // zero leaves the remote limit alone
        Ok((limit > 0).then_some(limit))
    }

    fn legacy_substitutions(&self, vars: &dyn VariableRenderer) -> LegacySubstitutions {
        let mut legacy = self.settings.legacy.clone();
        if let Some(facility) = vars.get(SYSLOG_FACILITY_VARIABLE) {
            legacy.syslog_facility = facility;
        }
        legacy
    }
}

fn template_error(target: &ModuleName, what: &str, e: &RenderError) -> BuildError {
    BuildError::Template {
        target: target.dotted(),
        what: what.to_owned(),
        message: e.message.clone(),
    }
}

/// Remote identity of a module file.
///
/// Core modules live under `ansible/modules/` and collection modules under
/// `ansible_collections/<ns>/<coll>/plugins/modules/`; anything else, or a
/// path that is not a valid dotted name, runs as `ansible.modules.<name>`.
pub fn derive_module_fqn(path: &Path, module_name: &str) -> ModuleName {
    let text = path.to_string_lossy().replace('\\', "/");
    let matched = CORE_MODULE_PATH
        .captures(&text)
        .or_else(|| COLLECTION_MODULE_PATH.captures(&text))
        .and_then(|caps| caps.name("path"))
        .map(|m| m.as_str().to_owned());

    if let Some(relative) = matched
        && !relative.contains('.')
    {
        let name = ModuleName::new(relative.split('/'));
        if name.is_valid() {
            return name;
        }
    }
    debug!("Could not determine the fully qualified name of {}", path.display());
    ModuleName::new(["ansible", "modules", module_name])
}
