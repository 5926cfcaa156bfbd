//! Commit-time isolation tests.
//!
//! Covers the three conflict shapes detected at commit (modify-delete,
//! delete-modify, exclusive-create), cascading deletes, the strict snapshot
//! boundary, and the exemption of transactions without tracked writes.

#![allow(missing_docs)]

mod common;

use umbra::{
    AttributeIid, Conflict, HasEdge, Result, ThingIid, TransactionKind, TypeId, UmbraError,
};

const PERSON: TypeId = TypeId(1);
const NAME: TypeId = TypeId(2);
const AGE: TypeId = TypeId(3);

fn person(key: u64) -> ThingIid {
    ThingIid::new(PERSON, key)
}

// ============================================================================
// CONFLICT SHAPES
// ============================================================================

#[test]
fn modify_after_concurrent_delete_conflicts() -> Result<()> {
    let (_store, db) = common::fresh()?;
    let alice = person(1);
    let name = AttributeIid::new(NAME, "alice");
    {
        let mut seed = db.transaction(TransactionKind::Write)?;
        seed.insert_thing(alice)?;
        seed.put_attribute(name.clone(), false)?;
        seed.commit()?;
    }

    let mut deleter = db.transaction(TransactionKind::Write)?;
    let mut modifier = db.transaction(TransactionKind::Write)?;
    assert!(deleter.delete_thing(alice)?);
    assert!(modifier.put_has(HasEdge::new(alice, name))?);

    deleter.commit()?;
    let err = modifier.commit().unwrap_err();
    assert_eq!(err.conflict(), Some(Conflict::ModifyDelete));
    assert_eq!(common::vertex_count(&db, PERSON)?, 0);
    assert_eq!(common::has_edge_count(&db, PERSON, NAME)?, 0);
    Ok(())
}

#[test]
fn delete_after_concurrent_modify_conflicts() -> Result<()> {
    let (_store, db) = common::fresh()?;
    let alice = person(1);
    let name = AttributeIid::new(NAME, "alice");
    {
        let mut seed = db.transaction(TransactionKind::Write)?;
        seed.insert_thing(alice)?;
        seed.put_attribute(name.clone(), false)?;
        seed.commit()?;
    }

    let mut modifier = db.transaction(TransactionKind::Write)?;
    let mut deleter = db.transaction(TransactionKind::Write)?;
    modifier.put_has(HasEdge::new(alice, name.clone()))?;
    deleter.delete_attribute(name.clone())?;

    modifier.commit()?;
    let err = deleter.commit().unwrap_err();
    assert!(matches!(err, UmbraError::Isolation(Conflict::DeleteModify)));

    let check = db.transaction(TransactionKind::Read)?;
    assert!(check.contains_attribute(&name)?);
    assert!(check.contains_has(&HasEdge::new(alice, name))?);
    Ok(())
}

#[test]
fn exclusive_attribute_creation_conflicts() -> Result<()> {
    let (_store, db) = common::fresh()?;
    let age = AttributeIid::long(AGE, 5);

    let mut first = db.transaction(TransactionKind::Write)?;
    let mut second = db.transaction(TransactionKind::Write)?;
    assert!(first.put_attribute(age.clone(), true)?);
    assert!(second.put_attribute(age.clone(), true)?);

    first.commit()?;
    let err = second.commit().unwrap_err();
    assert_eq!(err.conflict(), Some(Conflict::ExclusiveCreate));
    assert_eq!(common::vertex_count(&db, AGE)?, 1);
    Ok(())
}

#[test]
fn concurrent_thing_insertion_conflicts() -> Result<()> {
    let (_store, db) = common::fresh()?;
    let mut first = db.transaction(TransactionKind::Write)?;
    let mut second = db.transaction(TransactionKind::Write)?;
    first.insert_thing(person(7))?;
    second.insert_thing(person(7))?;
    second.commit()?;
    assert_eq!(
        first.commit().unwrap_err().conflict(),
        Some(Conflict::ExclusiveCreate)
    );
    assert_eq!(common::vertex_count(&db, PERSON)?, 1);
    Ok(())
}

#[test]
fn concurrent_thing_deletion_conflicts() -> Result<()> {
    let (_store, db) = common::fresh()?;
    let alice = person(1);
    let name = AttributeIid::new(NAME, "alice");
    {
        let mut seed = db.transaction(TransactionKind::Write)?;
        seed.insert_thing(alice)?;
        seed.insert_thing(person(2))?;
        seed.put_attribute(name.clone(), false)?;
        seed.put_has(HasEdge::new(alice, name.clone()))?;
        seed.commit()?;
    }

    let mut first = db.transaction(TransactionKind::Write)?;
    let mut second = db.transaction(TransactionKind::Write)?;
    assert!(first.delete_thing(alice)?);
    assert!(second.delete_thing(alice)?);

    first.commit()?;
    let err = second.commit().unwrap_err();
    assert_eq!(err.conflict(), Some(Conflict::ExclusiveCreate));

    common::settle(&db)?;
    assert_eq!(common::vertex_count(&db, PERSON)?, 1);
    assert_eq!(common::has_edge_count(&db, PERSON, NAME)?, 0);
    Ok(())
}

#[test]
fn attribute_deletion_removes_edges_pointing_at_it() -> Result<()> {
    let (_store, db) = common::fresh()?;
    let name = AttributeIid::new(NAME, "al");
    // Shares the byte prefix of `name` and must survive.
    let longer = AttributeIid::new(NAME, "alice");
    {
        let mut seed = db.transaction(TransactionKind::Write)?;
        for key in 1..=2 {
            seed.insert_thing(person(key))?;
        }
        seed.put_attribute(name.clone(), false)?;
        seed.put_attribute(longer.clone(), false)?;
        seed.put_has(HasEdge::new(person(1), name.clone()))?;
        seed.put_has(HasEdge::new(person(2), name.clone()))?;
        seed.put_has(HasEdge::new(person(1), longer.clone()))?;
        seed.commit()?;
    }
    assert_eq!(common::has_edge_count(&db, PERSON, NAME)?, 3);

    let mut tx = db.transaction(TransactionKind::Write)?;
    // An edge created in the same transaction goes too.
    tx.insert_thing(person(3))?;
    tx.put_has(HasEdge::new(person(3), name.clone()))?;
    assert!(tx.delete_attribute(name.clone())?);
    assert!(!tx.contains_has(&HasEdge::new(person(3), name.clone()))?);
    tx.commit()?;

    let check = db.transaction(TransactionKind::Read)?;
    assert!(!check.contains_attribute(&name)?);
    for key in 1..=3 {
        assert!(!check.contains_has(&HasEdge::new(person(key), name.clone()))?);
    }
    assert!(check.contains_has(&HasEdge::new(person(1), longer.clone()))?);
    assert_eq!(check.has_edge_count(PERSON, NAME)?, 1);
    assert_eq!(check.vertex_count(NAME)?, 1);
    drop(check);

    // The surviving edge is still reachable through its attribute.
    let mut tx = db.transaction(TransactionKind::Write)?;
    tx.delete_attribute(longer)?;
    tx.commit()?;
    assert_eq!(common::has_edge_count(&db, PERSON, NAME)?, 0);
    Ok(())
}

// ============================================================================
// BOUNDARIES AND EXEMPTIONS
// ============================================================================

#[test]
fn transaction_opened_after_commit_does_not_conflict() -> Result<()> {
    let (_store, db) = common::fresh()?;
    let alice = person(1);
    let name = AttributeIid::new(NAME, "alice");
    {
        let mut seed = db.transaction(TransactionKind::Write)?;
        seed.insert_thing(alice)?;
        seed.put_attribute(name.clone(), false)?;
        seed.commit()?;
    }
    let mut deleter = db.transaction(TransactionKind::Write)?;
    deleter.delete_attribute(name.clone())?;
    deleter.commit()?;

    // Reads at the deleter's end sequence, so it sees the deletion.
    let mut late = db.transaction(TransactionKind::Write)?;
    assert!(!late.contains_attribute(&name)?);
    assert!(late.put_attribute(name.clone(), false)?);
    late.commit()?;
    assert_eq!(common::vertex_count(&db, NAME)?, 1);
    Ok(())
}

#[test]
fn transactions_without_tracked_writes_never_conflict() -> Result<()> {
    let (_store, db) = common::fresh()?;
    let alice = person(1);
    {
        let mut seed = db.transaction(TransactionKind::Write)?;
        seed.insert_thing(alice)?;
        seed.commit()?;
    }
    let idle = db.transaction(TransactionKind::Write)?;
    let reader = db.transaction(TransactionKind::Read)?;
    let mut deleter = db.transaction(TransactionKind::Write)?;
    deleter.delete_thing(alice)?;
    deleter.commit()?;

    assert!(reader.contains_thing(&alice)?);
    idle.commit()?;
    reader.commit()?;
    Ok(())
}

#[test]
fn conflict_aborts_only_the_losing_transaction() -> Result<()> {
    let (_store, db) = common::fresh()?;
    let alice = person(1);
    let name = AttributeIid::new(NAME, "alice");
    {
        let mut seed = db.transaction(TransactionKind::Write)?;
        seed.insert_thing(alice)?;
        seed.put_attribute(name.clone(), false)?;
        seed.commit()?;
    }
    let mut deleter = db.transaction(TransactionKind::Write)?;
    let mut loser = db.transaction(TransactionKind::Write)?;
    let mut bystander = db.transaction(TransactionKind::Write)?;
    deleter.delete_thing(alice)?;
    loser.put_has(HasEdge::new(alice, name))?;
    bystander.insert_thing(person(2))?;

    deleter.commit()?;
    assert!(loser.commit().is_err());
    bystander.commit()?;
    assert_eq!(common::vertex_count(&db, PERSON)?, 1);
    assert_eq!(common::has_edge_count(&db, PERSON, NAME)?, 0);

    let snapshot = db.isolation_snapshot();
    assert_eq!(snapshot.uncommitted, 0);
    assert_eq!(snapshot.committing, 0);
    assert_eq!(snapshot.committed, 0);
    Ok(())
}

#[test]
fn failed_commit_leaves_no_trace_in_isolation_sets() -> Result<()> {
    let (_store, db) = common::fresh()?;
    let mut first = db.transaction(TransactionKind::Write)?;
    let mut second = db.transaction(TransactionKind::Write)?;
    first.put_attribute(AttributeIid::long(AGE, 1), true)?;
    second.put_attribute(AttributeIid::long(AGE, 1), true)?;
    let keep_open = db.transaction(TransactionKind::Write)?;
    first.commit()?;
    assert!(second.commit().is_err());

    let snapshot = db.isolation_snapshot();
    assert_eq!(snapshot.uncommitted, 1);
    assert_eq!(snapshot.committing, 0);
    assert_eq!(snapshot.committed, 1);
    drop(keep_open);
    assert_eq!(db.isolation_snapshot().committed, 0);
    Ok(())
}
