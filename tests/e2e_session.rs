//! End-to-end tests for the session engine.
//!
//! Nesting, abort-on-drop, read-committed isolation, completion hooks,
//! validators and optimistic property versions.

use std::sync::Arc;
use std::thread;

use hyperstore::{
    Cardinality, Command, Diagnostic, ElementStatus, Error, Identity, PropertyValue, Schema, SchemaBuilder,
    SessionCompletion, SessionHooks, SessionOptions, SessionState, Store, TrackingState, Value,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

// ============================================================================
// Helper: a store with the `lib` schema and domain loaded.
// ============================================================================

fn setup() -> (Store, Arc<Schema>) {
    let store = Store::open_memory();
    let schema = store
        .load_schema(
            SchemaBuilder::new("lib")
                .entity("Library", |e| e.property("Name", "unnamed"))
                .entity("Book", |e| e.property("Title", "").property("Copies", 1))
                .entity("Draft", |e| e.uncached())
                .relationship("LibraryHasBooks", "Library", "Book", Cardinality::OneToMany, |r| {
                    r.embedded()
                })
                .build(),
        )
        .unwrap();
    store.create_domain_model("lib", None).unwrap();
    (store, schema)
}

fn id(key: &str) -> Identity {
    Identity::new("lib", key)
}

// ============================================================================
// 1. Identity map
// ============================================================================

#[test]
fn test_same_reference_within_session() {
    let (store, schema) = setup();
    let mut session = store.begin_session(None).unwrap();
    let created = session.create_entity(&schema.get("Book").unwrap(), Some(id("b1"))).unwrap();

    let a = session.get_element(&id("b1")).unwrap().unwrap();
    let b = session.get_element(&id("b1")).unwrap().unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&a, &created));
    session.accept_changes().unwrap();

    let after = store.get_element(&id("b1"), None, false).unwrap().unwrap();
    assert!(Arc::ptr_eq(&after, &created));
}

#[test]
fn test_uncached_schema_yields_fresh_instances() {
    let (store, schema) = setup();
    let draft = schema.get("Draft").unwrap();
    let mut session = store.begin_session(None).unwrap();
    session.create_entity(&draft, Some(id("d1"))).unwrap();

    let a = session.get_element_with(&id("d1"), Some(&draft), false).unwrap().unwrap();
    let b = session.get_element_with(&id("d1"), Some(&draft), false).unwrap().unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    session.accept_changes().unwrap();
}

#[test]
fn test_removed_and_readded_element_is_a_new_instance() {
    let (store, schema) = setup();
    let book = schema.get("Book").unwrap();
    let mut session = store.begin_session(None).unwrap();
    let old = session.create_entity(&book, Some(id("b1"))).unwrap();
    session.accept_changes().unwrap();
    drop(session);

    let mut session = store.begin_session(None).unwrap();
    assert!(Arc::ptr_eq(&session.get_element(&id("b1")).unwrap().unwrap(), &old));
    session.remove_element(&id("b1"), true).unwrap();
    let readded = session.create_entity(&book, Some(id("b1"))).unwrap();
    assert!(!Arc::ptr_eq(&readded, &old));
    assert_eq!(readded.status(), ElementStatus::Created);
    assert!(readded.sequence() > old.sequence());
    assert!(Arc::ptr_eq(&session.get_element(&id("b1")).unwrap().unwrap(), &readded));
    session.accept_changes().unwrap();
    drop(session);

    assert_eq!(old.status(), ElementStatus::Removed);
    assert_eq!(readded.status(), ElementStatus::Active);
    let after = store.get_element(&id("b1"), None, false).unwrap().unwrap();
    assert!(Arc::ptr_eq(&after, &readded));
}

// ============================================================================
// 2. Abort and nesting
// ============================================================================

#[test]
fn test_drop_without_accept_discards_everything() {
    let (store, schema) = setup();
    {
        let session = store.begin_session(None).unwrap();
        session.create_entity(&schema.get("Library").unwrap(), Some(id("lib"))).unwrap();
        session.create_entity(&schema.get("Book").unwrap(), Some(id("b1"))).unwrap();
        session.set_property_value(&id("lib"), "Name", "Central").unwrap();
    }
    assert!(store.get_element(&id("lib"), None, false).unwrap().is_none());
    assert!(store.get_element(&id("b1"), None, false).unwrap().is_none());
    assert_eq!(store.locks().grant_count(), 0);

    // The identities are free again.
    let mut session = store.begin_session(None).unwrap();
    session.create_entity(&schema.get("Library").unwrap(), Some(id("lib"))).unwrap();
    session.accept_changes().unwrap();
    assert!(store.get_element(&id("lib"), None, false).unwrap().is_some());
}

#[test]
fn test_nested_accept_does_not_commit() {
    let (store, schema) = setup();
    let mut outer = store.begin_session(None).unwrap();
    {
        let mut inner = store.begin_session(None).unwrap();
        assert!(inner.is_nested());
        assert_eq!(inner.depth(), 2);
        assert_eq!(inner.id(), outer.id());
        inner.create_entity(&schema.get("Book").unwrap(), Some(id("b1"))).unwrap();
        inner.accept_changes().unwrap();
        assert!(matches!(inner.execute(Vec::new()), Err(Error::SessionClosed(_))));
    }

    // Visible to the chain, not to other threads.
    assert!(outer.get_element(&id("b1")).unwrap().is_some());
    let seen_elsewhere = thread::scope(|s| {
        s.spawn(|| store.get_element(&id("b1"), None, false).unwrap().is_some()).join().unwrap()
    });
    assert!(!seen_elsewhere);

    outer.accept_changes().unwrap();
    let seen_elsewhere = thread::scope(|s| {
        s.spawn(|| store.get_element(&id("b1"), None, false).unwrap().is_some()).join().unwrap()
    });
    assert!(seen_elsewhere);
}

#[test]
fn test_nested_accept_is_idempotent() {
    let (store, schema) = setup();
    let mut outer = store.begin_session(None).unwrap();
    {
        let mut inner = store.begin_session(None).unwrap();
        inner.create_entity(&schema.get("Book").unwrap(), Some(id("b1"))).unwrap();
        inner.accept_changes().unwrap();
        inner.accept_changes().unwrap();
    }
    outer.accept_changes().unwrap();
    assert_eq!(outer.state(), SessionState::Committed);
    assert!(matches!(outer.accept_changes(), Err(Error::SessionClosed(_))));
}

#[test]
fn test_nested_drop_aborts_the_chain() {
    let (store, schema) = setup();
    let mut outer = store.begin_session(None).unwrap();
    outer.create_entity(&schema.get("Book").unwrap(), Some(id("b1"))).unwrap();
    {
        let inner = store.begin_session(None).unwrap();
        inner.create_entity(&schema.get("Book").unwrap(), Some(id("b2"))).unwrap();
    }

    let err = outer.accept_changes().unwrap_err();
    assert!(matches!(err, Error::TransactionAborted(tx) if tx == outer.id()));
    assert_eq!(outer.state(), SessionState::Aborted);
    drop(outer);

    assert!(store.get_element(&id("b1"), None, false).unwrap().is_none());
    assert!(store.get_element(&id("b2"), None, false).unwrap().is_none());
}

#[test]
fn test_accept_with_open_nested_session_fails() {
    let (store, _) = setup();
    let mut outer = store.begin_session(None).unwrap();
    let _inner = store.begin_session(None).unwrap();
    assert!(matches!(outer.accept_changes(), Err(Error::TxError(_))));
}

#[test]
fn test_closed_session_rejects_commands() {
    let (store, schema) = setup();
    let mut session = store.begin_session(None).unwrap();
    session.accept_changes().unwrap();
    assert_eq!(session.state(), SessionState::Committed);

    let err = session.execute([Command::AddEntity { id: id("b1"), schema: schema.get("Book").unwrap() }]);
    assert!(matches!(err, Err(Error::SessionClosed(_))));
    assert!(matches!(session.accept_changes(), Err(Error::SessionClosed(_))));
}

#[test]
fn test_sequential_sessions_are_independent_roots() {
    let (store, _) = setup();
    let mut first = store.begin_session(None).unwrap();
    let first_id = first.id();
    first.accept_changes().unwrap();
    drop(first);

    let second = store.begin_session(None).unwrap();
    assert!(!second.is_nested());
    assert_ne!(second.id(), first_id);
}

// ============================================================================
// 3. Session modes
// ============================================================================

#[test]
fn test_read_only_session() {
    let (store, schema) = setup();
    let session = store.begin_session(Some(SessionOptions::new().read_only())).unwrap();
    let err = session.create_entity(&schema.get("Book").unwrap(), Some(id("b1")));
    assert!(matches!(err, Err(Error::ReadOnly(_))));
    assert!(session.get_element(&id("b1")).unwrap().is_none());
}

#[test]
fn test_store_execute_uses_thread_session() {
    let (store, schema) = setup();
    let book = schema.get("Book").unwrap();
    let err = store.execute([Command::AddEntity { id: id("b1"), schema: book.clone() }]);
    assert!(matches!(err, Err(Error::SessionRequired(_))));

    let mut session = store.begin_session(None).unwrap();
    store.execute([Command::AddEntity { id: id("b1"), schema: book }]).unwrap();
    assert_eq!(session.tracking_state(&id("b1")), Some(TrackingState::Added));
    session.accept_changes().unwrap();
    assert!(store.get_element(&id("b1"), None, false).unwrap().is_some());
}

#[test]
fn test_store_level_mutations_need_a_session() {
    let (store, schema) = setup();
    let library = schema.get("Library").unwrap();
    let book = schema.get("Book").unwrap();
    let has_books = schema.get("LibraryHasBooks").unwrap();
    assert!(matches!(store.create_entity(&library, None), Err(Error::SessionRequired(_))));

    let mut session = store.begin_session(None).unwrap();
    let lib = store.create_entity(&library, Some(id("lib"))).unwrap();
    let b1 = store.create_entity(&book, Some(id("b1"))).unwrap();
    let rel = store
        .create_relationship(&has_books, lib.id(), &library, b1.id(), &book, None)
        .unwrap();
    store.set_property_value(lib.id(), "Name", "Central").unwrap();
    assert!(Arc::ptr_eq(&session.get_element(rel.id()).unwrap().unwrap(), &rel));
    session.accept_changes().unwrap();
    drop(session);

    assert_eq!(store.get_property_value(lib.id(), "Name").unwrap().value, Value::from("Central"));
    assert!(matches!(store.remove_element(lib.id(), true), Err(Error::SessionRequired(_))));
}

#[test]
fn test_generated_identities_use_default_domain() {
    let (store, schema) = setup();
    let mut session = store.begin_session(None).unwrap();
    let a = session.create_entity(&schema.get("Book").unwrap(), None).unwrap();
    let b = session.create_entity(&schema.get("Book").unwrap(), None).unwrap();
    assert_eq!(a.id().domain(), "lib");
    assert_ne!(a.id(), b.id());
    session.accept_changes().unwrap();
}

// ============================================================================
// 4. Tracking
// ============================================================================

#[test]
fn test_tracking_states() {
    let (store, schema) = setup();
    let mut session = store.begin_session(None).unwrap();
    session.create_entity(&schema.get("Book").unwrap(), Some(id("b1"))).unwrap();
    session.set_property_value(&id("b1"), "Title", "Dune").unwrap();
    assert_eq!(session.tracking_state(&id("b1")), Some(TrackingState::Added));
    session.accept_changes().unwrap();
    drop(session);

    let mut session = store.begin_session(None).unwrap();
    session.set_property_value(&id("b1"), "Title", "Dune Messiah").unwrap();
    assert_eq!(session.tracking_state(&id("b1")), Some(TrackingState::Modified));
    session.remove_element(&id("b1"), true).unwrap();
    assert_eq!(session.tracking_state(&id("b1")), Some(TrackingState::Removed));
    assert!(session.get_element(&id("b1")).unwrap().is_none());

    let tracked = session.tracked();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].schema, Identity::new("lib", "Book"));
    session.accept_changes().unwrap();
    assert!(store.get_element(&id("b1"), None, false).unwrap().is_none());
}

// ============================================================================
// 5. Properties
// ============================================================================

#[test]
fn test_property_version_round_trip() {
    let (store, schema) = setup();
    let mut session = store.begin_session(None).unwrap();
    session.create_entity(&schema.get("Book").unwrap(), Some(id("b1"))).unwrap();

    assert_eq!(
        session.get_property_value(&id("b1"), "Title").unwrap(),
        PropertyValue::new("", 0)
    );
    session.set_property_value(&id("b1"), "Title", "v1").unwrap();
    assert_eq!(session.get_property_value(&id("b1"), "Title").unwrap(), PropertyValue::new("v1", 1));

    session.set_property_value_checked(&id("b1"), "Title", "v2", 1).unwrap();
    assert_eq!(session.get_property_value(&id("b1"), "Title").unwrap().version, 2);

    let conflict = session.set_property_value_checked(&id("b1"), "Title", "v3", 1);
    assert!(matches!(conflict, Err(Error::VersionConflict { expected: 1, actual: 2, .. })));
    session.accept_changes().unwrap();

    assert_eq!(
        store.get_property_value(&id("b1"), "Title").unwrap(),
        PropertyValue::new("v2", 2)
    );
}

#[test]
fn test_unknown_property() {
    let (store, schema) = setup();
    let session = store.begin_session(None).unwrap();
    session.create_entity(&schema.get("Book").unwrap(), Some(id("b1"))).unwrap();
    assert!(matches!(
        session.set_property_value(&id("b1"), "Isbn", "x"),
        Err(Error::MetadataNotFound(_))
    ));
    assert!(matches!(
        session.get_property_value(&id("ghost"), "Title"),
        Err(Error::InvalidReference(_))
    ));
}

#[test]
fn test_default_value_before_first_write() {
    let (store, schema) = setup();
    let session = store.begin_session(None).unwrap();
    session.create_entity(&schema.get("Book").unwrap(), Some(id("b1"))).unwrap();
    let copies = session.get_property_value(&id("b1"), "Copies").unwrap();
    assert_eq!(copies.value, Value::Int(1));
    assert!(copies.is_default());
}

// ============================================================================
// 6. Completion pipeline
// ============================================================================

#[test]
fn test_completion_errors_reach_notifiers() {
    let (store, schema) = setup();
    let diagnostics = Arc::new(Mutex::new(Vec::<Diagnostic>::new()));
    let sink = diagnostics.clone();
    store.events().errors.subscribe(Arc::new(move |d: &Diagnostic| sink.lock().push(d.clone())));
    store.events().session_created.subscribe(Arc::new(|hooks: &SessionHooks| {
        hooks.on_completing(Arc::new(|_: &SessionCompletion<'_>| -> hyperstore::Result<()> {
            Err(Error::TxError("hook failed".into()))
        }));
        hooks.on_completing(Arc::new(|_: &SessionCompletion<'_>| -> hyperstore::Result<()> {
            panic!("hook panicked")
        }));
        Ok(())
    }));

    let mut session = store.begin_session(None).unwrap();
    let session_id = session.id();
    session.create_entity(&schema.get("Book").unwrap(), Some(id("b1"))).unwrap();
    session.accept_changes().unwrap();
    drop(session);

    let diagnostics = diagnostics.lock();
    assert_eq!(diagnostics.len(), 2);
    assert!(diagnostics.iter().all(|d| d.session == Some(session_id)));
    assert!(diagnostics[0].message.contains("hook failed"));
    assert!(diagnostics[1].message.contains("hook panicked"));
    assert!(store.get_element(&id("b1"), None, false).unwrap().is_some());
    assert_eq!(store.locks().grant_count(), 0);
}

#[test]
fn test_completing_hook_sees_outcome() {
    let (store, schema) = setup();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    store.events().session_created.subscribe(Arc::new(move |hooks: &SessionHooks| {
        let sink = sink.clone();
        hooks.on_completing(Arc::new(move |c: &SessionCompletion<'_>| {
            sink.lock().push((c.aborted, c.events.len()));
            Ok(())
        }));
        Ok(())
    }));

    {
        let session = store.begin_session(None).unwrap();
        session.create_entity(&schema.get("Book").unwrap(), Some(id("b1"))).unwrap();
    }
    let mut session = store.begin_session(None).unwrap();
    session.create_entity(&schema.get("Book").unwrap(), Some(id("b2"))).unwrap();
    session.accept_changes().unwrap();

    assert_eq!(*seen.lock(), vec![(true, 1), (false, 1)]);
}

#[test]
fn test_failing_validator_aborts() {
    let (store, schema) = setup();
    store.events().before_commit.subscribe(Arc::new(|c: &SessionCompletion<'_>| {
        if c.tracking.len() > 1 {
            Err(Error::ConstraintViolation("at most one change per session".into()))
        } else {
            Ok(())
        }
    }));

    let mut session = store.begin_session(None).unwrap();
    session.create_entity(&schema.get("Book").unwrap(), Some(id("b1"))).unwrap();
    session.create_entity(&schema.get("Book").unwrap(), Some(id("b2"))).unwrap();
    assert!(matches!(session.accept_changes(), Err(Error::ConstraintViolation(_))));
    assert_eq!(session.state(), SessionState::Aborted);
    drop(session);
    assert!(store.get_element(&id("b1"), None, false).unwrap().is_none());

    let mut session = store.begin_session(None).unwrap();
    session.create_entity(&schema.get("Book").unwrap(), Some(id("b1"))).unwrap();
    session.accept_changes().unwrap();
    assert!(store.get_element(&id("b1"), None, false).unwrap().is_some());
}

// ============================================================================
// 7. Isolation
// ============================================================================

#[test]
fn test_uncommitted_property_not_visible_to_other_threads() {
    let (store, schema) = setup();
    let mut setup_session = store.begin_session(None).unwrap();
    setup_session.create_entity(&schema.get("Book").unwrap(), Some(id("b1"))).unwrap();
    setup_session.accept_changes().unwrap();
    drop(setup_session);

    let mut session = store.begin_session(None).unwrap();
    session.set_property_value(&id("b1"), "Title", "draft").unwrap();

    let other = thread::scope(|s| {
        s.spawn(|| store.get_property_value(&id("b1"), "Title").unwrap()).join().unwrap()
    });
    assert_eq!(other, PropertyValue::new("", 0));

    session.accept_changes().unwrap();
    let other = thread::scope(|s| {
        s.spawn(|| store.get_property_value(&id("b1"), "Title").unwrap()).join().unwrap()
    });
    assert_eq!(other, PropertyValue::new("draft", 1));
}
