#![allow(clippy::disallowed_methods)]

use std::{
    sync::{
        Barrier,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use satchel::{
    ModuleName,
    cache::{BuildCache, CacheKey},
    lock::LockRegistry,
    types::Compression,
};
use tempfile::TempDir;

const WORKERS: usize = 8;

fn key(name: &str) -> CacheKey {
    CacheKey::new(
        name,
        ModuleName::new(["ansible", "modules", name]),
        Compression::Deflated,
    )
}

#[test]
fn test_concurrent_workers_agree_on_one_artifact() {
    let temp_dir = TempDir::new().unwrap();
    let cache = BuildCache::in_dir(temp_dir.path());
    let builds = AtomicUsize::new(0);
    let barrier = Barrier::new(WORKERS);
    let key = key("ping");

    let results: Vec<Vec<u8>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..WORKERS)
            .map(|worker| {
                let cache = &cache;
                let builds = &builds;
                let barrier = &barrier;
                let key = &key;
                scope.spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_build(key, || {
                            builds.fetch_add(1, Ordering::SeqCst);
                            Ok(format!("built by worker {worker}").into_bytes())
                        })
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(builds.load(Ordering::SeqCst), 1);
    let first = &results[0];
    assert!(results.iter().all(|bytes| bytes == first));
    assert_eq!(&std::fs::read(cache.artifact_path(&key)).unwrap(), first);
}

#[test]
fn test_distinct_modules_build_independently() {
    let temp_dir = TempDir::new().unwrap();
    let locks = LockRegistry::with_locks(temp_dir.path(), ["ping", "setup"]);
    let cache = BuildCache::new(temp_dir.path(), locks);

    thread::scope(|scope| {
        for name in ["ping", "setup", "copy", "file"] {
            let cache = &cache;
            scope.spawn(move || {
                let bytes = cache
                    .get_or_build(&key(name), || Ok(name.as_bytes().to_vec()))
                    .unwrap();
                assert_eq!(bytes, name.as_bytes());
            });
        }
    });

    for name in ["ping", "setup", "copy", "file"] {
        assert!(cache.artifact_path(&key(name)).is_file());
    }
    assert!(temp_dir.path().join(".locks").join("ping.lock").exists());
    assert!(temp_dir.path().join(".locks").join("generic.lock").exists());
}

#[test]
fn test_existing_artifact_is_reused_across_instances() {
    let temp_dir = TempDir::new().unwrap();
    let key = key("ping");

    let first = BuildCache::in_dir(temp_dir.path())
        .get_or_build(&key, || Ok(b"original".to_vec()))
        .unwrap();
    let second = BuildCache::in_dir(temp_dir.path())
        .get_or_build(&key, || Ok(b"rebuilt".to_vec()))
        .unwrap();

    assert_eq!(first, b"original");
    assert_eq!(second, b"original");
}
