//! Static discovery of helper-library imports.
//!
//! The scanner parses a module with ruff's parser and walks every statement
//! scope looking for `import` and `from ... import` statements that refer to
//! the helper namespaces. Nothing is evaluated; conditional and
//! function-local imports count the same as module-level ones because an
//! optional import still has to be shipped.

use indexmap::IndexSet;
use log::debug;
use ruff_python_ast::{
    Expr, Stmt, StmtImport, StmtImportFrom,
    visitor::{Visitor, walk_stmt},
};
use ruff_python_parser::parse_module;
use thiserror::Error;

use crate::module_name::ModuleName;

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ScanError {
    pub message: String,
}

const EXTERNAL_PLUGINS_DIR: &str = "plugins";
const EXTERNAL_HELPERS_DIR: &str = "module_utils";

/// Namespaces whose imports are dependencies of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportPrefixes {
    /// Core helper namespace, e.g. `ansible.module_utils`
    pub core: ModuleName,
    /// Root of externally distributed helper packages, e.g. `ansible_collections`
    pub external: ModuleName,
    /// Private module name of the bundled compatibility shim, e.g. `_six`
    pub shim: Option<String>,
}

impl ImportPrefixes {
    fn is_core(&self, name: &ModuleName) -> bool {
        name.starts_with(&self.core)
    }

    /// `<external>.<namespace>.<collection>.plugins.module_utils[.more]`
    fn is_external(&self, name: &ModuleName) -> bool {
        matches!(
            name.strip_prefix(&self.external),
            Some([_, _, plugins, helpers, ..])
                if plugins == EXTERNAL_PLUGINS_DIR && helpers == EXTERNAL_HELPERS_DIR
        )
    }

    fn is_recognized(&self, name: &ModuleName) -> bool {
        self.is_core(name) || self.is_external(name)
    }
}

#[derive(Debug, Clone)]
pub struct ImportScanner {
    prefixes: ImportPrefixes,
}

impl ImportScanner {
    pub fn new(prefixes: ImportPrefixes) -> Self {
        Self { prefixes }
    }

    pub fn prefixes(&self) -> &ImportPrefixes {
        &self.prefixes
    }

    /// Collect the helper references of one module.
    ///
    /// `self_identity` is the module's own dotted name, used to absolutize
    /// relative imports; pass an empty name when it is unknown. References
    /// keep a possible trailing symbol name, so `from a.b import c` yields
    /// `a.b.c` whether `c` is a submodule or an attribute.
    pub fn scan(
        &self,
        source: &[u8],
        self_identity: &ModuleName,
    ) -> Result<IndexSet<ModuleName>, ScanError> {
        let text = std::str::from_utf8(source).map_err(|e| ScanError {
            message: format!("source is not valid UTF-8: {e}"),
        })?;
        let parsed = parse_module(text).map_err(|e| ScanError {
            message: e.to_string(),
        })?;

        let mut visitor = HelperImportVisitor::new(&self.prefixes, self_identity);
        visitor.visit_body(&parsed.syntax().body);
        Ok(visitor.references)
    }
}

struct HelperImportVisitor<'p> {
    prefixes: &'p ImportPrefixes,
    identity: &'p ModuleName,
    references: IndexSet<ModuleName>,
}

impl<'p> HelperImportVisitor<'p> {
    fn new(prefixes: &'p ImportPrefixes, identity: &'p ModuleName) -> Self {
        Self {
            prefixes,
            identity,
            references: IndexSet::new(),
        }
    }

    /// `import a.b.c [as x]`
    fn record_import(&mut self, stmt: &StmtImport) {
        for alias in &stmt.names {
            let name = ModuleName::parse(alias.name.as_str());
            // A bare `import ansible.module_utils` names the namespace itself
            if (self.prefixes.is_core(&name) && name.len() > self.prefixes.core.len())
                || self.prefixes.is_external(&name)
            {
                self.references.insert(name);
            }
        }
    }

    /// `from a.b import c, d` and its relative forms
    fn record_import_from(&mut self, stmt: &StmtImportFrom) {
        if let (Some(shim), Some(first)) = (&self.prefixes.shim, stmt.names.first())
            && first.name.as_str() == shim
        {
            self.references.insert(ModuleName::new([shim.as_str()]));
            return;
        }

        let Some(module) = self.absolute_module(stmt) else {
            return;
        };
        if !self.prefixes.is_recognized(&module) {
            return;
        }
        for alias in &stmt.names {
            self.references.insert(module.child(alias.name.as_str()));
        }
    }

    fn absolute_module(&self, stmt: &StmtImportFrom) -> Option<ModuleName> {
        let written = stmt
            .module
            .as_ref()
            .map(|m| ModuleName::parse(m.as_str()))
            .unwrap_or_default();
        if stmt.level == 0 {
            return Some(written);
        }

        let level = stmt.level as usize;
        if self.identity.is_empty() {
            debug!("Skipping relative import at level {level}: importing module has no identity");
            return None;
        }
        let Some(base) = self.identity.drop_last(level) else {
            debug!(
                "Skipping relative import at level {level}: '{}' has no such parent",
                self.identity
            );
            return None;
        };
        Some(base.join(&written))
    }
}

impl<'a> Visitor<'a> for HelperImportVisitor<'_> {
    fn visit_stmt(&mut self, stmt: &'a Stmt) {
        match stmt {
            Stmt::Import(import_stmt) => self.record_import(import_stmt),
            Stmt::ImportFrom(import_from) => self.record_import_from(import_from),
            _ => walk_stmt(self, stmt),
        }
    }

    // Imports never appear inside expressions
    fn visit_expr(&mut self, _expr: &'a Expr) {}
}
