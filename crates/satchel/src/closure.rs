//! Transitive helper closure of a target module.
//!
//! Starting from the target's own imports, every helper reference is
//! resolved to a source unit, written to the payload archive, and scanned
//! for further references until nothing new turns up. A module is scanned at
//! most once, which is what makes import cycles terminate.

use std::collections::VecDeque;

use indexmap::{IndexMap, IndexSet};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    archive::ArchiveWriter,
    error::{BuildError, Result},
    module_name::ModuleName,
    source_store::{DISTRIBUTION_DEPTH, LookupError, SourceStore, SourceUnit},
    visitors::{ImportPrefixes, ImportScanner},
};

/// Initializer written for every package of the helper namespace itself.
///
/// The helper tree may rely on namespace-package tricks that the remote
/// interpreter does not replicate, so each namespace level gets a real
/// initializer that extends its own search path.
pub const NAMESPACE_INIT_STUB: &[u8] =
    b"from pkgutil import extend_path\n__path__ = extend_path(__path__, __name__)\n";

/// Helper that the bootstrap imports to hand over the module arguments.
pub const ALWAYS_INCLUDED: &str = "basic";

/// A vendored third-party library whose private module is imported in a way
/// the generic rules cannot follow (`six` and its `_six` payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatShim {
    /// Package directory inside the helper tree, e.g. `six`
    pub package: String,
    /// Private module inside that package, e.g. `_six`
    pub module: String,
}

/// Where helper modules live in the import namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperLayout {
    pub core: ModuleName,
    pub external: ModuleName,
    pub shim: Option<CompatShim>,
}

impl Default for CompatShim {
    fn default() -> Self {
        Self {
            package: "six".to_owned(),
            module: "_six".to_owned(),
        }
    }
}

impl HelperLayout {
    pub fn prefixes(&self) -> ImportPrefixes {
        ImportPrefixes {
            core: self.core.clone(),
            external: self.external.clone(),
            shim: self.shim.as_ref().map(|shim| shim.module.clone()),
        }
    }

    fn shim_reference(&self) -> Option<ModuleName> {
        self.shim
            .as_ref()
            .map(|shim| ModuleName::new([shim.module.as_str()]))
    }
}

/// Archive entries produced by one closure build, in write order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureReport {
    pub entries: Vec<String>,
    pub helper_count: usize,
    /// References that were logged and left out of the archive
    pub skipped: Vec<String>,
}

/// Per-build resolution state. Never shared between builds.
#[derive(Debug, Default)]
struct ClosureState {
    /// Modules already written and scanned; only ever grows
    processed: IndexSet<ModuleName>,
    /// Resolved units waiting to be written and scanned
    cache: IndexMap<ModuleName, SourceUnit>,
    skipped: IndexSet<String>,
}

impl ClosureState {
    fn seeded(core: &ModuleName) -> Self {
        let mut state = Self::default();
        for len in 1..=core.len() {
            if let Some(package) = core.prefix(len) {
                let name = package.package_init();
                state.cache.insert(
                    name.clone(),
                    SourceUnit::synthetic(name, NAMESPACE_INIT_STUB, "[namespace stub]"),
                );
            }
        }
        state
    }

    fn skip(&mut self, reference: &ModuleName) {
        self.skipped.insert(reference.dotted());
    }

    fn is_known(&self, name: &ModuleName) -> bool {
        self.processed.contains(name) || self.cache.contains_key(name)
    }

    /// Queue a unit unless it is already processed or queued.
    fn admit(&mut self, unit: SourceUnit, discovered: &mut IndexSet<ModuleName>) {
        if self.is_known(&unit.name) {
            return;
        }
        discovered.insert(unit.name.clone());
        self.cache.insert(unit.name.clone(), unit);
    }
}

#[derive(Debug)]
pub struct ClosureBuilder<'a> {
    layout: &'a HelperLayout,
    store: &'a SourceStore,
    scanner: ImportScanner,
}

impl<'a> ClosureBuilder<'a> {
    pub fn new(layout: &'a HelperLayout, store: &'a SourceStore) -> Self {
        Self {
            layout,
            store,
            scanner: ImportScanner::new(layout.prefixes()),
        }
    }

    /// Write the target's helper closure into `out`, then the target itself.
    pub fn build(&self, target: &SourceUnit, out: &mut ArchiveWriter) -> Result<ClosureReport> {
        let target_name = &target.name;
        let mut state = ClosureState::seeded(&self.layout.core);
        state.processed.insert(target_name.clone());

        let seeds: Vec<ModuleName> = state.cache.keys().cloned().collect();
        for name in seeds {
            if let Some(unit) = state.cache.shift_remove(&name) {
                out.add(&name.archive_path(), &unit.source)?;
                state.processed.insert(name);
            }
        }

        // The bootstrap imports this helper itself, so it must exist even if
        // the target never names it.
        let required = self.layout.core.child(ALWAYS_INCLUDED);
        if self.locate_core(target_name, &required)?.is_none() {
            return Err(unresolved(
                target_name,
                target_name,
                &required,
                vec![required.dotted()],
            ));
        }

        let mut references = self.scan_unit(target_name, &target.source, target_name)?;
        references.insert(required);

        let mut frontier = VecDeque::from([(target_name.clone(), references)]);
        let mut helper_count = 0;
        while let Some((importer, references)) = frontier.pop_front() {
            let mut discovered = IndexSet::new();
            for reference in &references {
                if state.processed.contains(reference) {
                    continue;
                }
                self.resolve_reference(target_name, &importer, reference, &mut state, &mut discovered)?;
            }

            for name in discovered {
                let Some(unit) = state.cache.shift_remove(&name) else {
                    continue;
                };
                debug!("Using helper {name} from {}", unit.origin);
                out.add(&name.archive_path(), &unit.source)?;
                state.processed.insert(name.clone());
                helper_count += 1;

                let next = self.scan_unit(target_name, &unit.source, &name)?;
                frontier.push_back((name, next));
            }
        }

        self.add_target(target, out)?;
        info!("Packed {target_name} with {helper_count} helper files");
        Ok(ClosureReport {
            entries: out.entries().map(str::to_owned).collect(),
            helper_count,
            skipped: state.skipped.into_iter().collect(),
        })
    }

    fn scan_unit(
        &self,
        target: &ModuleName,
        source: &[u8],
        identity: &ModuleName,
    ) -> Result<IndexSet<ModuleName>> {
        self.scanner
            .scan(source, identity)
            .map_err(|e| BuildError::Parse {
                target: target.dotted(),
                module: identity.dotted(),
                message: e.message,
            })
    }

    /// The target goes last, under its fully qualified path, together with
    /// empty initializers for any of its packages not already present.
    fn add_target(&self, target: &SourceUnit, out: &mut ArchiveWriter) -> Result<()> {
        for ancestor in target.name.ancestors() {
            let path = ancestor.package_init().archive_path();
            if !out.contains(&path) {
                out.add(&path, b"")?;
            }
        }
        out.add(&target.name.archive_path(), &target.source)
    }

    fn resolve_reference(
        &self,
        target: &ModuleName,
        importer: &ModuleName,
        reference: &ModuleName,
        state: &mut ClosureState,
        discovered: &mut IndexSet<ModuleName>,
    ) -> Result<()> {
        if self.layout.shim_reference().as_ref() == Some(reference) {
            return self.resolve_shim(target, importer, reference, state, discovered);
        }
        if reference.starts_with(&self.layout.external) {
            return self.resolve_external(target, importer, reference, state, discovered);
        }
        if reference.starts_with(&self.layout.core) {
            return self.resolve_core(target, importer, reference, state, discovered);
        }
        warn!("Skipping unrecognized import '{reference}' in {importer}");
        state.skip(reference);
        Ok(())
    }

    /// Full name first, then with the last segment dropped. Trying the
    /// shorter name first would read `pkg.foo` as an attribute of `pkg` even
    /// when a `pkg/foo.py` submodule exists.
    fn interpretations(reference: &ModuleName) -> Vec<ModuleName> {
        let mut candidates = vec![reference.clone()];
        candidates.extend(reference.parent().filter(|parent| !parent.is_empty()));
        candidates
    }

    fn resolve_core(
        &self,
        target: &ModuleName,
        importer: &ModuleName,
        reference: &ModuleName,
        state: &mut ClosureState,
        discovered: &mut IndexSet<ModuleName>,
    ) -> Result<()> {
        let core = &self.layout.core;
        if reference.len() <= core.len() {
            warn!("Skipping import of the helper namespace itself ('{reference}') in {importer}");
            state.skip(reference);
            return Ok(());
        }

        let mut attempted = Vec::new();
        for candidate in Self::interpretations(reference) {
            // Only the namespace package is left; `reference` names no helper module
            if candidate.len() <= core.len() {
                warn!(
                    "Skipping '{reference}' in {importer}: no helper module by that name, \
                     reading it as a name defined in {core}"
                );
                state.skip(reference);
                return Ok(());
            }
            if state.is_known(&candidate) || state.is_known(&candidate.package_init()) {
                return Ok(());
            }
            if let Some(unit) = self.locate_core(target, &candidate)? {
                debug!("Resolved '{reference}' as {}", unit.name);
                self.ensure_core_ancestors(target, importer, &candidate, state, discovered)?;
                state.admit(unit, discovered);
                return Ok(());
            }
            attempted.push(candidate.dotted());
        }

        Err(unresolved(target, importer, reference, attempted))
    }

    /// Look up one core-namespace module by its full name.
    fn locate_core(&self, target: &ModuleName, name: &ModuleName) -> Result<Option<SourceUnit>> {
        let Some((leaf, package)) = name
            .strip_prefix(&self.layout.core)
            .and_then(<[String]>::split_last)
        else {
            return Ok(None);
        };
        let dirs = self.store.helper_dirs(package);
        let located = self
            .store
            .resolve(leaf, &dirs)
            .map_err(|e| lookup_error(target, e))?;
        Ok(located.map(|located| {
            let normalized = if located.is_package {
                name.package_init()
            } else {
                name.clone()
            };
            SourceUnit::new(normalized, located)
        }))
    }

    /// Every package between the namespace and `name` needs its own
    /// initializer, read from the helper tree.
    fn ensure_core_ancestors(
        &self,
        target: &ModuleName,
        importer: &ModuleName,
        name: &ModuleName,
        state: &mut ClosureState,
        discovered: &mut IndexSet<ModuleName>,
    ) -> Result<()> {
        let core_len = self.layout.core.len();
        for ancestor in name.ancestors().filter(|a| a.len() > core_len) {
            let init = ancestor.package_init();
            if state.is_known(&init) {
                continue;
            }
            match self.locate_core(target, &ancestor)? {
                Some(unit) if unit.is_package => state.admit(unit, discovered),
                _ => {
                    return Err(unresolved(
                        target,
                        importer,
                        name,
                        vec![init.dotted()],
                    ));
                }
            }
        }
        Ok(())
    }

    fn resolve_external(
        &self,
        target: &ModuleName,
        importer: &ModuleName,
        reference: &ModuleName,
        state: &mut ClosureState,
        discovered: &mut IndexSet<ModuleName>,
    ) -> Result<()> {
        let candidates: Vec<ModuleName> = Self::interpretations(reference)
            .into_iter()
            .filter(|c| c.len() > DISTRIBUTION_DEPTH)
            .collect();
        if candidates.is_empty() {
            warn!("Skipping import '{reference}' in {importer}: it does not name a module inside a package");
            state.skip(reference);
            return Ok(());
        }

        let mut attempted = Vec::new();
        for candidate in candidates {
            if state.is_known(&candidate) || state.is_known(&candidate.package_init()) {
                return Ok(());
            }
            let (Some(leaf), Some(parent)) = (candidate.last(), candidate.parent()) else {
                continue;
            };
            let found = self
                .store
                .resolve_packaged(leaf, std::slice::from_ref(&parent))
                .map_err(|e| lookup_error(target, e))?;
            if let Some((name, located)) = found {
                // Distributed packages carry no namespace initializers of
                // their own that we could rely on; ship empty ones.
                for ancestor in name.ancestors() {
                    let init = ancestor.package_init();
                    state.admit(
                        SourceUnit::synthetic(init, Vec::new(), "[package stub]"),
                        discovered,
                    );
                }
                let normalized = if located.is_package {
                    name.package_init()
                } else {
                    name
                };
                debug!("Resolved '{reference}' as {normalized}");
                state.admit(SourceUnit::new(normalized, located), discovered);
                return Ok(());
            }
            attempted.push(candidate.dotted());
        }

        Err(unresolved(target, importer, reference, attempted))
    }

    /// The shim's private module lives inside its own package directory and
    /// is registered under the helper namespace regardless of how it was
    /// imported.
    fn resolve_shim(
        &self,
        target: &ModuleName,
        importer: &ModuleName,
        reference: &ModuleName,
        state: &mut ClosureState,
        discovered: &mut IndexSet<ModuleName>,
    ) -> Result<()> {
        let Some(shim) = &self.layout.shim else {
            return Ok(());
        };
        let name = self.layout.core.child(shim.package.as_str()).child(shim.module.as_str());
        if state.is_known(&name) || state.is_known(&name.package_init()) {
            return Ok(());
        }
        match self.locate_core(target, &name)? {
            Some(unit) => {
                self.ensure_core_ancestors(target, importer, &name, state, discovered)?;
                state.admit(unit, discovered);
                Ok(())
            }
            None => Err(unresolved(target, importer, reference, vec![name.dotted()])),
        }
    }
}

fn unresolved(
    target: &ModuleName,
    importer: &ModuleName,
    reference: &ModuleName,
    attempted: Vec<String>,
) -> BuildError {
    BuildError::UnresolvedDependency {
        target: target.dotted(),
        importer: importer.dotted(),
        reference: reference.dotted(),
        attempted,
    }
}

fn lookup_error(target: &ModuleName, e: LookupError) -> BuildError {
    BuildError::io(target, e.path, e.source)
}

#[cfg(test)]
mod tests {
    use std::{fs, io::Cursor, path::Path};

    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use zip::ZipArchive;

    use super::*;
    use crate::{source_store::LocatedSource, types::Compression};

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().expect("file has a parent")).expect("create dirs");
        fs::write(path, content).expect("write fixture");
    }

    fn layout(core: &str) -> HelperLayout {
        HelperLayout {
            core: ModuleName::parse(core),
            external: ModuleName::parse("ansible_collections"),
            shim: Some(CompatShim {
                package: "six".to_owned(),
                module: "_six".to_owned(),
            }),
        }
    }

    fn target(name: &str, source: &str) -> SourceUnit {
        SourceUnit::new(
            ModuleName::parse(name),
            LocatedSource {
                source: source.as_bytes().to_vec(),
                origin: "<test>".to_owned(),
                is_package: false,
            },
        )
    }

    fn build(layout: &HelperLayout, store: &SourceStore, unit: &SourceUnit) -> Result<Vec<String>> {
        let timestamp = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("valid timestamp");
        let mut out = ArchiveWriter::new(&unit.name, Compression::Stored, timestamp)?;
        let report = ClosureBuilder::new(layout, store).build(unit, &mut out)?;
        let bytes = out.finish()?;
        let archive = ZipArchive::new(Cursor::new(bytes)).expect("valid zip");
        let mut names: Vec<String> = archive.file_names().map(str::to_owned).collect();
        names.sort();
        let mut reported = report.entries;
        reported.sort();
        assert_eq!(names, reported);
        Ok(names)
    }

    #[test]
    fn test_example_closure_has_five_entries() -> Result<()> {
        let temp_dir = TempDir::new().expect("temp dir");
        let tree = temp_dir.path().join("helperlib");
        write(&tree, "basic.py", "ARGS = None\n");
        write(&tree, "util/__init__.py", "");
        write(&tree, "util/net.py", "import socket\n");

        let layout = layout("helperlib");
        let store = SourceStore::with_helper_paths(vec![tree]);
        let unit = target("mymodule", "import helperlib.basic\nimport helperlib.util.net\n");

        assert_eq!(
            build(&layout, &store, &unit)?,
            vec![
                "helperlib/__init__.py",
                "helperlib/basic.py",
                "helperlib/util/__init__.py",
                "helperlib/util/net.py",
                "mymodule.py",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_submodule_preferred_over_parent_symbol() -> Result<()> {
        let temp_dir = TempDir::new().expect("temp dir");
        let tree = temp_dir.path().to_path_buf();
        write(&tree, "basic.py", "");
        write(&tree, "pkg/__init__.py", "def foo():\n    pass\n");
        write(&tree, "pkg/foo.py", "VALUE = 1\n");

        let layout = layout("helperlib");
        let store = SourceStore::with_helper_paths(vec![tree]);
        let unit = target("mymodule", "from helperlib.pkg import foo\n");

        let entries = build(&layout, &store, &unit)?;
        assert!(entries.contains(&"helperlib/pkg/foo.py".to_owned()));
        assert!(entries.contains(&"helperlib/pkg/__init__.py".to_owned()));
        Ok(())
    }

    #[test]
    fn test_symbol_import_falls_back_to_module() -> Result<()> {
        let temp_dir = TempDir::new().expect("temp dir");
        let tree = temp_dir.path().to_path_buf();
        write(&tree, "basic.py", "class AnsibleModule:\n    pass\n");

        let layout = layout("ansible.module_utils");
        let store = SourceStore::with_helper_paths(vec![tree]);
        let unit = target(
            "ansible.modules.ping",
            "from ansible.module_utils.basic import AnsibleModule\n",
        );

        assert_eq!(
            build(&layout, &store, &unit)?,
            vec![
                "ansible/__init__.py",
                "ansible/module_utils/__init__.py",
                "ansible/module_utils/basic.py",
                "ansible/modules/__init__.py",
                "ansible/modules/ping.py",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_unresolved_dependency_names_both_interpretations() {
        let temp_dir = TempDir::new().expect("temp dir");
        let tree = temp_dir.path().to_path_buf();
        write(&tree, "basic.py", "");

        let layout = layout("ansible.module_utils");
        let store = SourceStore::with_helper_paths(vec![tree]);
        let unit = target(
            "ansible.modules.ping",
            "from ansible.module_utils.missing import thing\n",
        );

        let err = build(&layout, &store, &unit).expect_err("missing helper must fail");
        match err {
            BuildError::UnresolvedDependency {
                importer,
                attempted,
                ..
            } => {
                assert_eq!(importer, "ansible.modules.ping");
                assert_eq!(
                    attempted,
                    vec![
                        "ansible.module_utils.missing.thing",
                        "ansible.module_utils.missing",
                    ]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_basic_is_fatal() {
        let temp_dir = TempDir::new().expect("temp dir");
        let layout = layout("helperlib");
        let store = SourceStore::with_helper_paths(vec![temp_dir.path().to_path_buf()]);
        let unit = target("mymodule", "print('no imports')\n");

        let err = build(&layout, &store, &unit).expect_err("basic is always required");
        assert!(matches!(err, BuildError::UnresolvedDependency { .. }));
    }

    #[test]
    fn test_parse_error_names_helper() {
        let temp_dir = TempDir::new().expect("temp dir");
        let tree = temp_dir.path().to_path_buf();
        write(&tree, "basic.py", "def broken(:\n");

        let layout = layout("helperlib");
        let store = SourceStore::with_helper_paths(vec![tree]);
        let unit = target("mymodule", "");

        match build(&layout, &store, &unit).expect_err("broken helper must fail") {
            BuildError::Parse { module, target, .. } => {
                assert_eq!(module, "helperlib.basic");
                assert_eq!(target, "mymodule");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_shim_is_registered_under_namespace() -> Result<()> {
        let temp_dir = TempDir::new().expect("temp dir");
        let tree = temp_dir.path().to_path_buf();
        write(&tree, "basic.py", "from ansible.module_utils import six\n");
        write(&tree, "six/__init__.py", "from ansible.module_utils.six import _six\n");
        write(&tree, "six/_six.py", "PY3 = True\n");

        let layout = layout("ansible.module_utils");
        let store = SourceStore::with_helper_paths(vec![tree]);
        let unit = target("ping", "");

        assert_eq!(
            build(&layout, &store, &unit)?,
            vec![
                "ansible/__init__.py",
                "ansible/module_utils/__init__.py",
                "ansible/module_utils/basic.py",
                "ansible/module_utils/six/__init__.py",
                "ansible/module_utils/six/_six.py",
                "ping.py",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_unrecognized_shapes_are_skipped() -> Result<()> {
        let temp_dir = TempDir::new().expect("temp dir");
        let tree = temp_dir.path().to_path_buf();
        write(&tree, "basic.py", "");

        let layout = layout("helperlib");
        let store = SourceStore::with_helper_paths(vec![tree]);
        let unit = target(
            "mymodule",
            "import ansible_collections.ns\nfrom helperlib import VERSION\n",
        );

        assert_eq!(
            build(&layout, &store, &unit)?,
            vec!["helperlib/__init__.py", "helperlib/basic.py", "mymodule.py"]
        );
        Ok(())
    }

    #[test]
    fn test_missing_name_under_namespace_root_is_reported_as_skipped() -> Result<()> {
        let temp_dir = TempDir::new().expect("temp dir");
        let tree = temp_dir.path().to_path_buf();
        write(&tree, "basic.py", "");

        let layout = layout("ansible.module_utils");
        let store = SourceStore::with_helper_paths(vec![tree]);
        let unit = target(
            "ping",
            "from ansible.module_utils import basicc\nfrom ansible.module_utils import basic\n",
        );

        let timestamp = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("valid timestamp");
        let mut out = ArchiveWriter::new(&unit.name, Compression::Stored, timestamp)?;
        let report = ClosureBuilder::new(&layout, &store).build(&unit, &mut out)?;

        assert_eq!(report.skipped, vec!["ansible.module_utils.basicc"]);
        assert_eq!(
            report.entries,
            vec![
                "ansible/__init__.py",
                "ansible/module_utils/__init__.py",
                "ansible/module_utils/basic.py",
                "ping.py",
            ]
        );
        Ok(())
    }
}
