#![allow(clippy::disallowed_methods)]

use std::{fs, io::Cursor, path::Path};

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use satchel::{
    BuildError, ModuleName,
    archive::ArchiveWriter,
    closure::{ClosureBuilder, HelperLayout},
    source_store::{FsPackageData, LocatedSource, SourceStore, SourceUnit},
    types::Compression,
};
use tempfile::TempDir;
use zip::ZipArchive;

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn layout(core: &str) -> HelperLayout {
    HelperLayout {
        core: ModuleName::parse(core),
        external: ModuleName::parse("ansible_collections"),
        shim: None,
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

/// Build the closure and return the archive's entry names in write order.
fn build(layout: &HelperLayout, store: &SourceStore, unit: &SourceUnit) -> Result<Vec<String>, BuildError> {
    let timestamp = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap();
    let mut out = ArchiveWriter::new(&unit.name, Compression::Deflated, timestamp)?;
    ClosureBuilder::new(layout, store).build(unit, &mut out)?;
    let bytes = out.finish()?;
    let archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
    Ok(archive.file_names().map(str::to_owned).collect())
}

fn sorted(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names
}

#[test]
fn test_five_entry_example_snapshot() {
    let temp_dir = TempDir::new().unwrap();
    let tree = temp_dir.path().join("helperlib");
    write(&tree, "basic.py", "ARGS = None\n");
    write(&tree, "util/__init__.py", "");
    write(&tree, "util/net.py", "import socket\n");

    let store = SourceStore::with_helper_paths(vec![tree]);
    let unit = target("mymodule", "import helperlib.basic\nimport helperlib.util.net\n");
    let entries = sorted(build(&layout("helperlib"), &store, &unit).unwrap());

    insta::assert_snapshot!(entries.join("\n"), @r"
    helperlib/__init__.py
    helperlib/basic.py
    helperlib/util/__init__.py
    helperlib/util/net.py
    mymodule.py
    ");
}

#[test]
fn test_target_is_written_last() {
    let temp_dir = TempDir::new().unwrap();
    let tree = temp_dir.path().to_path_buf();
    write(&tree, "basic.py", "from helperlib import text\n");
    write(&tree, "text.py", "");

    let store = SourceStore::with_helper_paths(vec![tree]);
    let unit = target("mymodule", "");
    let entries = build(&layout("helperlib"), &store, &unit).unwrap();

    assert_eq!(entries.first().map(String::as_str), Some("helperlib/__init__.py"));
    assert_eq!(entries.last().map(String::as_str), Some("mymodule.py"));
}

#[test]
fn test_transitive_chain() {
    let temp_dir = TempDir::new().unwrap();
    let tree = temp_dir.path().to_path_buf();
    write(&tree, "basic.py", "");
    write(&tree, "a.py", "from helperlib import b\n");
    write(&tree, "b.py", "def f():\n    import helperlib.c\n");
    write(&tree, "c.py", "");
    write(&tree, "unused.py", "");

    let store = SourceStore::with_helper_paths(vec![tree]);
    let unit = target("mymodule", "from helperlib import a\n");
    let entries = sorted(build(&layout("helperlib"), &store, &unit).unwrap());

    assert_eq!(
        entries,
        vec![
            "helperlib/__init__.py",
            "helperlib/a.py",
            "helperlib/b.py",
            "helperlib/basic.py",
            "helperlib/c.py",
            "mymodule.py",
        ]
    );
}

#[test]
fn test_diamond_writes_shared_helper_once() {
    let temp_dir = TempDir::new().unwrap();
    let tree = temp_dir.path().to_path_buf();
    write(&tree, "basic.py", "from helperlib import left, right\n");
    write(&tree, "left.py", "from helperlib.shared import VALUE\n");
    write(&tree, "right.py", "import helperlib.shared\n");
    write(&tree, "shared.py", "VALUE = 1\n");

    let store = SourceStore::with_helper_paths(vec![tree]);
    let unit = target("mymodule", "");
    let entries = build(&layout("helperlib"), &store, &unit).unwrap();

    let shared = entries.iter().filter(|e| *e == "helperlib/shared.py").count();
    assert_eq!(shared, 1);
    assert_eq!(entries.len(), 6);
}

#[test]
fn test_self_import_terminates() {
    let temp_dir = TempDir::new().unwrap();
    let tree = temp_dir.path().to_path_buf();
    write(&tree, "basic.py", "import helperlib.basic\n");

    let store = SourceStore::with_helper_paths(vec![tree]);
    let unit = target("mymodule", "");
    let entries = sorted(build(&layout("helperlib"), &store, &unit).unwrap());

    assert_eq!(
        entries,
        vec!["helperlib/__init__.py", "helperlib/basic.py", "mymodule.py"]
    );
}

#[test]
fn test_mutual_cycle_terminates() {
    let temp_dir = TempDir::new().unwrap();
    let tree = temp_dir.path().to_path_buf();
    write(&tree, "basic.py", "");
    write(&tree, "ping.py", "from helperlib import pong\n");
    write(&tree, "pong.py", "from helperlib import ping\n");

    let store = SourceStore::with_helper_paths(vec![tree]);
    let unit = target("mymodule", "from helperlib import ping\n");
    let entries = sorted(build(&layout("helperlib"), &store, &unit).unwrap());

    assert_eq!(
        entries,
        vec![
            "helperlib/__init__.py",
            "helperlib/basic.py",
            "helperlib/ping.py",
            "helperlib/pong.py",
            "mymodule.py",
        ]
    );
}

#[test]
fn test_first_helper_path_wins() {
    let temp_dir = TempDir::new().unwrap();
    let first = temp_dir.path().join("first");
    let second = temp_dir.path().join("second");
    write(&first, "basic.py", "SOURCE = 'first'\n");
    write(&second, "basic.py", "SOURCE = 'second'\n");
    write(&second, "extra.py", "");

    let store = SourceStore::with_helper_paths(vec![first, second]);
    let unit = target("mymodule", "from helperlib import extra\n");
    let timestamp = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap();
    let mut out = ArchiveWriter::new(&unit.name, Compression::Stored, timestamp).unwrap();
    ClosureBuilder::new(&layout("helperlib"), &store)
        .build(&unit, &mut out)
        .unwrap();

    let mut archive = ZipArchive::new(Cursor::new(out.finish().unwrap())).unwrap();
    let mut basic = String::new();
    std::io::Read::read_to_string(&mut archive.by_name("helperlib/basic.py").unwrap(), &mut basic)
        .unwrap();
    assert_eq!(basic, "SOURCE = 'first'\n");
    assert!(archive.by_name("helperlib/extra.py").is_ok());
}

#[test]
fn test_external_package_helpers_get_empty_initializers() {
    let temp_dir = TempDir::new().unwrap();
    let helpers = temp_dir.path().join("helpers");
    let collections = temp_dir.path().join("collections");
    write(&helpers, "basic.py", "");
    write(
        &collections,
        "ansible_collections/ns/coll/plugins/module_utils/net.py",
        "from ansible.module_utils import basic\n",
    );

    let store = SourceStore::new(vec![helpers], Box::new(FsPackageData::new(vec![collections])));
    let unit = target(
        "ansible_collections.ns.coll.plugins.modules.thing",
        "from ansible_collections.ns.coll.plugins.module_utils.net import connect\n",
    );
    let entries = sorted(build(&layout("ansible.module_utils"), &store, &unit).unwrap());

    assert_eq!(
        entries,
        vec![
            "ansible/__init__.py",
            "ansible/module_utils/__init__.py",
            "ansible/module_utils/basic.py",
            "ansible_collections/__init__.py",
            "ansible_collections/ns/__init__.py",
            "ansible_collections/ns/coll/__init__.py",
            "ansible_collections/ns/coll/plugins/__init__.py",
            "ansible_collections/ns/coll/plugins/module_utils/__init__.py",
            "ansible_collections/ns/coll/plugins/module_utils/net.py",
            "ansible_collections/ns/coll/plugins/modules/__init__.py",
            "ansible_collections/ns/coll/plugins/modules/thing.py",
        ]
    );
}

#[test]
fn test_missing_helper_reports_importer() {
    let temp_dir = TempDir::new().unwrap();
    let tree = temp_dir.path().to_path_buf();
    write(&tree, "basic.py", "from helperlib.gone import thing\n");

    let store = SourceStore::with_helper_paths(vec![tree]);
    let unit = target("mymodule", "");
    match build(&layout("helperlib"), &store, &unit).unwrap_err() {
        BuildError::UnresolvedDependency {
            target,
            importer,
            reference,
            ..
        } => {
            assert_eq!(target, "mymodule");
            assert_eq!(importer, "helperlib.basic");
            assert_eq!(reference, "helperlib.gone.thing");
        }
        other => panic!("unexpected error: {other}"),
    }
}
