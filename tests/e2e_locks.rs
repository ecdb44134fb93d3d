//! End-to-end tests for session locks.
//!
//! Upgrade without self-deadlock, scoped handles, blocking between
//! sessions on different threads, timeouts and upgrade conflicts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;
use std::thread;
use std::time::{Duration, Instant};

use hyperstore::{
    Error, Identity, IsolationLevel, LockType, PropertyValue, SchemaBuilder, SessionOptions, Store,
    Value,
};
use pretty_assertions::assert_eq;

// ============================================================================
// Helper
// ============================================================================

fn setup() -> Store {
    let store = Store::open_memory();
    let schema = store
        .load_schema(SchemaBuilder::new("lib").entity("Book", |e| e.property("Title", "")).build())
        .unwrap();
    store.create_domain_model("lib", None).unwrap();

    let mut session = store.begin_session(None).unwrap();
    session.create_entity(&schema.get("Book").unwrap(), Some(book())).unwrap();
    session.accept_changes().unwrap();
    drop(session);
    store
}

fn book() -> Identity {
    Identity::new("lib", "b1")
}

fn waiting(timeout: Duration) -> Option<SessionOptions> {
    Some(SessionOptions::new().timeout(timeout))
}

// ============================================================================
// 1. Single session
// ============================================================================

#[test]
fn test_upgrade_and_scoped_release() {
    let store = setup();
    {
        let session = store.begin_session(None).unwrap();
        let x_shared = session.acquire_lock(LockType::Shared, "X").unwrap();
        let x_exclusive = session.acquire_lock(LockType::Exclusive, "X").unwrap();
        let y = session.acquire_lock(LockType::Exclusive, "Y").unwrap();
        assert_eq!(store.locks().held_by(session.id()), vec!["X".to_string(), "Y".to_string()]);

        // Disposing the X handles releases X only.
        drop(x_exclusive);
        drop(x_shared);
        assert!(!store.locks().is_locked("X"));
        assert!(store.locks().is_locked("Y"));
        assert_eq!(y.key(), "Y");
    }
    // End of block: the Y handle and the session are gone.
    assert!(!store.locks().is_locked("Y"));
    assert_eq!(store.locks().grant_count(), 0);
}

#[test]
fn test_session_completion_releases_held_locks() {
    let store = setup();
    let mut session = store.begin_session(None).unwrap();
    let handle = session.acquire_lock(LockType::Exclusive, "Z").unwrap();
    session.set_property_value(&book(), "Title", "Dune").unwrap();
    assert!(store.locks().is_locked("lib:b1"));

    session.accept_changes().unwrap();
    assert!(!store.locks().is_locked("Z"));
    assert!(!store.locks().is_locked("lib:b1"));
    // Releasing after completion is a no-op.
    handle.release();
    assert_eq!(store.locks().grant_count(), 0);
}

#[test]
fn test_read_only_session_takes_shared_locks_only() {
    let store = setup();
    let session = store.begin_session(Some(SessionOptions::new().read_only())).unwrap();
    let _shared = session.acquire_lock(LockType::Shared, "X").unwrap();
    assert!(matches!(session.acquire_lock(LockType::Exclusive, "X"), Err(Error::ReadOnly(_))));
}

// ============================================================================
// 2. Two sessions
// ============================================================================

#[test]
fn test_shared_request_blocks_until_upgrade_released() {
    let store = setup();
    let ready = Barrier::new(2);
    let released = AtomicBool::new(false);

    thread::scope(|s| {
        let waiter = s.spawn(|| {
            ready.wait();
            let session = store.begin_session(waiting(Duration::from_secs(5))).unwrap();
            let started = Instant::now();
            let _shared = session.acquire_lock(LockType::Shared, "X").unwrap();
            (released.load(Ordering::SeqCst), started.elapsed())
        });

        let mut session = store.begin_session(None).unwrap();
        let _x = session.acquire_lock(LockType::Shared, "X").unwrap();
        let _up = session.acquire_lock(LockType::Exclusive, "X").unwrap();
        ready.wait();
        thread::sleep(Duration::from_millis(150));
        released.store(true, Ordering::SeqCst);
        session.accept_changes().unwrap();

        let (was_released, waited) = waiter.join().unwrap();
        assert!(was_released);
        assert!(waited >= Duration::from_millis(50));
    });
}

#[test]
fn test_lock_wait_times_out() {
    let store = setup();
    let ready = Barrier::new(2);
    let done = Barrier::new(2);

    thread::scope(|s| {
        let waiter = s.spawn(|| {
            ready.wait();
            let session = store.begin_session(waiting(Duration::from_millis(50))).unwrap();
            let result = session.acquire_lock(LockType::Shared, "X").map(|_| ());
            done.wait();
            result
        });

        let session = store.begin_session(None).unwrap();
        let _x = session.acquire_lock(LockType::Exclusive, "X").unwrap();
        ready.wait();
        done.wait();

        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::LockTimeout { key, .. } if key == "X"));
    });
}

#[test]
fn test_writers_on_same_element_serialize() {
    let store = setup();
    let ready = Barrier::new(2);
    let committed = AtomicBool::new(false);

    thread::scope(|s| {
        let second = s.spawn(|| {
            ready.wait();
            let mut session = store.begin_session(waiting(Duration::from_secs(5))).unwrap();
            session.set_property_value(&book(), "Title", "second").unwrap();
            let saw_commit = committed.load(Ordering::SeqCst);
            session.accept_changes().unwrap();
            saw_commit
        });

        let mut session = store.begin_session(None).unwrap();
        session.set_property_value(&book(), "Title", "first").unwrap();
        ready.wait();
        thread::sleep(Duration::from_millis(100));
        committed.store(true, Ordering::SeqCst);
        session.accept_changes().unwrap();

        assert!(second.join().unwrap());
    });

    assert_eq!(
        store.get_property_value(&book(), "Title").unwrap(),
        PropertyValue::new("second", 2)
    );
}

#[test]
fn test_second_upgrader_gets_conflict() {
    let store = setup();
    let both_read = Barrier::new(2);
    let serializable = || {
        Some(
            SessionOptions::new()
                .isolation(IsolationLevel::Serializable)
                .timeout(Duration::from_secs(5)),
        )
    };

    thread::scope(|s| {
        let first = s.spawn(|| {
            let mut session = store.begin_session(serializable()).unwrap();
            session.get_element(&book()).unwrap();
            both_read.wait();
            // Waits for the other reader to let go of its Shared lock.
            session.set_property_value(&book(), "Title", "first")?;
            session.accept_changes()
        });

        let session = store.begin_session(serializable()).unwrap();
        session.get_element(&book()).unwrap();
        both_read.wait();
        thread::sleep(Duration::from_millis(200));
        let err = session.set_property_value(&book(), "Title", "second").unwrap_err();
        assert!(matches!(err, Error::LockConflict { .. }));
        drop(session);

        first.join().unwrap().unwrap();
    });

    assert_eq!(store.get_property_value(&book(), "Title").unwrap().value, Value::from("first"));
}
