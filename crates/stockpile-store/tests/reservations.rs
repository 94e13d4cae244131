//! Reservation and cache lifecycle tests across threads.

use stockpile_schema::{ContentHash, ManualClock};
use stockpile_store::{
    verify_cache_integrity, ContentStore, StoreError, StoreLayout, VerifyOutcome,
};
use std::fs;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn open_store(root: &std::path::Path) -> ContentStore {
    let layout = StoreLayout::new(root);
    layout.initialize().unwrap();
    ContentStore::open(&layout)
}

#[test]
fn second_holder_waits_until_first_scope_exits() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    let hash = ContentHash::of_bytes(b"Hello.");

    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder = {
        let store = store.clone();
        let hash = hash.clone();
        thread::spawn(move || {
            store
                .with_key(&hash, |_| {
                    held_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                })
                .unwrap();
        })
    };

    held_rx.recv().unwrap();
    assert!(matches!(
        store.reserve(&hash),
        Err(StoreError::ReservationUnavailable(h)) if h == hash
    ));

    release_tx.send(()).unwrap();
    holder.join().unwrap();
    assert!(store.reserve(&hash).is_ok());
}

#[test]
fn distinct_hashes_do_not_contend() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    let a = store.reserve(&ContentHash::of_bytes(b"a")).unwrap();
    let b = store.reserve(&ContentHash::of_bytes(b"b")).unwrap();
    assert_ne!(a.file(), b.file());
}

#[test]
fn clear_during_verification_leaves_held_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    let busy = ContentHash::of_bytes(&vec![1u8; 64 * 1024]);
    let idle = ContentHash::of_bytes(b"idle");
    fs::write(store.file_for(&busy), vec![1u8; 64 * 1024]).unwrap();
    fs::write(store.file_for(&idle), b"idle").unwrap();

    let (started_tx, started_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let verifier = {
        let store = store.clone();
        let busy = busy.clone();
        thread::spawn(move || {
            let reservation = store.reserve(&busy).unwrap();
            started_tx.send(()).unwrap();
            go_rx.recv().unwrap();
            store
                .verify(
                    &reservation,
                    None,
                    &ManualClock::new(0),
                    &|| false,
                    &mut |_, _| {},
                )
                .unwrap()
        })
    };

    started_rx.recv().unwrap();
    let cleared = store.clear().unwrap();
    assert_eq!(cleared.len(), 1);
    assert_eq!(cleared[0].hash, idle);
    go_tx.send(()).unwrap();

    let outcome = verifier.join().unwrap();
    assert!(matches!(outcome, VerifyOutcome::Verified(_)));
    assert!(store.file_for(&busy).exists());
}

#[test]
fn integrity_scan_after_partial_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    for i in 0..5u8 {
        let data = vec![i; 1000 + usize::from(i)];
        fs::write(store.file_for(&ContentHash::of_bytes(&data)), &data).unwrap();
    }
    let victim = ContentHash::of_bytes(&vec![3u8; 1003]);
    fs::write(store.file_for(&victim), b"truncated").unwrap();

    let report = verify_cache_integrity(&store, &ManualClock::new(0)).unwrap();
    assert_eq!(report.checked, 5);
    assert_eq!(report.passed, 4);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].hash, victim);
}

#[test]
fn reservation_released_when_holder_thread_panics() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    let hash = ContentHash::of_bytes(b"panic");
    let worker = {
        let store = store.clone();
        let hash = hash.clone();
        thread::spawn(move || {
            let _r = store.reserve(&hash).unwrap();
            thread::sleep(Duration::from_millis(10));
            panic!("worker failed");
        })
    };
    assert!(worker.join().is_err());
    assert!(!store.is_reserved(&hash));
}
