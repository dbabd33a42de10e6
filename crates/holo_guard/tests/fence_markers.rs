//! File-backed fence markers: idempotence and state precedence on disk.

mod common;

use std::sync::Arc;

use common::{cleanup_dir, test_dir};
use holo_guard::fence::Marker;
use holo_guard::{FenceLedger, FenceState, FileMarkerStore};

fn ledger(name: &str) -> (std::path::PathBuf, FileMarkerStore, FenceLedger) {
    let dir = test_dir(name);
    cleanup_dir(&dir);
    let store = FileMarkerStore::new(dir.clone());
    let ledger = FenceLedger::new(Arc::new(store.clone()));
    (dir, store, ledger)
}

#[test]
fn missing_directory_reads_as_unfenced() {
    let (dir, _store, ledger) = ledger("fence-missing");
    assert_eq!(ledger.state().unwrap(), FenceState::Unfenced);
    assert!(!ledger.is_registered().unwrap());
    ledger.remove_zombie_lock().unwrap();
    ledger.remove_readonly_lock().unwrap();
    cleanup_dir(&dir);
}

#[test]
fn writing_locks_twice_leaves_disk_unchanged() {
    let (dir, store, ledger) = ledger("fence-idempotent");

    ledger.write_zombie_lock("host-2").unwrap();
    let first = std::fs::read_to_string(store.path(Marker::ZombieLock)).unwrap();
    ledger.write_zombie_lock("host-2").unwrap();
    let second = std::fs::read_to_string(store.path(Marker::ZombieLock)).unwrap();
    assert_eq!(first, second);

    ledger.write_readonly_lock().unwrap();
    ledger.write_readonly_lock().unwrap();
    assert!(store.path(Marker::ReadonlyLock).exists());

    let mut names: Vec<String> = std::fs::read_dir(&dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["readonly.lock".to_string(), "zombie.lock".to_string()]);
    cleanup_dir(&dir);
}

#[test]
fn zombie_lock_dominates_and_survives_restart() {
    let (dir, _store, ledger) = ledger("fence-restart");
    ledger.write_readonly_lock().unwrap();
    ledger.write_zombie_lock("").unwrap();
    drop(ledger);

    let reopened = FenceLedger::new(Arc::new(FileMarkerStore::new(dir.clone())));
    assert_eq!(
        reopened.state().unwrap(),
        FenceState::Zombie { deferred_to: None }
    );

    reopened.remove_zombie_lock().unwrap();
    assert_eq!(reopened.state().unwrap(), FenceState::ReadOnly);
    reopened.remove_readonly_lock().unwrap();
    assert!(reopened.state().unwrap().allows_writes());
    cleanup_dir(&dir);
}

#[test]
fn registration_certificate_persists() {
    let (dir, _store, ledger) = ledger("fence-registration");
    ledger.issue_registration_certificate("host-1").unwrap();
    let reopened = FenceLedger::new(Arc::new(FileMarkerStore::new(dir.clone())));
    assert!(reopened.is_registered().unwrap());
    cleanup_dir(&dir);
}
