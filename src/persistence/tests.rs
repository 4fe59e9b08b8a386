use chrono::{Duration, Utc};
use tempfile::{TempDir, tempdir};

use super::{DeadLetterRecord, RetryRecord, Store};

fn create_test_store() -> (TempDir, Store) {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path().to_str().unwrap()).unwrap();
    (dir, store)
}

fn retry_row(payload: &str, retry_in: Duration) -> RetryRecord {
    let now = Utc::now();
    RetryRecord {
        id: 0,
        key: "k".into(),
        value: payload.into(),
        topic: "t".into(),
        partition: 0,
        kafka_offset: 7,
        retry_count: 1,
        retry_at: now + retry_in,
        created_at: now,
    }
}

#[test]
fn test_tables_open_idempotently() {
    let (_dir, store) = create_test_store();
    let first = store.retry_table("retry_messages").unwrap();
    first.insert(retry_row("a", Duration::minutes(1))).unwrap();

    let again = store.retry_table("retry_messages").unwrap();
    assert_eq!(again.len(), 1);
    assert!(store.dead_letter_table("dead_letter_messages").unwrap().is_empty());
}

#[test]
fn test_insert_assigns_distinct_ids() {
    let (_dir, store) = create_test_store();
    let retries = store.retry_table("retry").unwrap();
    let a = retries.insert(retry_row("a", Duration::minutes(1))).unwrap();
    let b = retries.insert(retry_row("b", Duration::minutes(1))).unwrap();
    assert_ne!(a.id, b.id);
    assert_eq!(retries.list().unwrap().len(), 2);
}

#[test]
fn test_claim_due_returns_only_due_rows_in_retry_order() {
    let (_dir, store) = create_test_store();
    let retries = store.retry_table("retry").unwrap();
    retries.insert(retry_row("later", Duration::seconds(-5))).unwrap();
    retries.insert(retry_row("earlier", Duration::seconds(-60))).unwrap();
    retries.insert(retry_row("future", Duration::minutes(10))).unwrap();

    let due = retries.claim_due(Utc::now()).unwrap();
    let payloads: Vec<_> = due.iter().map(|r| r.value.as_str()).collect();
    assert_eq!(payloads, vec!["earlier", "later"]);

    let remaining = retries.list().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].value, "future");
}

#[test]
fn test_claimed_rows_are_not_returned_twice() {
    let (_dir, store) = create_test_store();
    let retries = store.retry_table("retry").unwrap();
    retries.insert(retry_row("due", Duration::seconds(-1))).unwrap();

    let now = Utc::now();
    assert_eq!(retries.claim_due(now).unwrap().len(), 1);
    assert!(retries.claim_due(now).unwrap().is_empty());
    assert!(retries.is_empty());
}

#[test]
fn test_restore_puts_claimed_row_back() {
    let (_dir, store) = create_test_store();
    let retries = store.retry_table("retry").unwrap();
    retries.insert(retry_row("due", Duration::seconds(-1))).unwrap();

    let claimed = retries.claim_due(Utc::now()).unwrap();
    retries.restore(&claimed[0]).unwrap();
    assert_eq!(retries.list().unwrap(), claimed);
}

#[test]
fn test_claimed_row_is_held_until_settled() {
    let (_dir, store) = create_test_store();
    let retries = store.retry_table("retry").unwrap();
    retries.insert(retry_row("due", Duration::seconds(-1))).unwrap();

    let claimed = retries.claim_due(Utc::now()).unwrap();
    assert!(retries.is_empty());
    assert_eq!(retries.claimed_len(), 1);

    retries.settle(claimed[0].id).unwrap();
    assert_eq!(retries.claimed_len(), 0);
    assert_eq!(retries.recover_claimed().unwrap(), 0);
    assert!(retries.is_empty());
}

#[test]
fn test_restore_clears_the_claim() {
    let (_dir, store) = create_test_store();
    let retries = store.retry_table("retry").unwrap();
    retries.insert(retry_row("due", Duration::seconds(-1))).unwrap();

    let claimed = retries.claim_due(Utc::now()).unwrap();
    retries.restore(&claimed[0]).unwrap();
    assert_eq!(retries.claimed_len(), 0);
    assert_eq!(retries.len(), 1);
}

#[test]
fn test_unsettled_claims_are_recovered() {
    let (_dir, store) = create_test_store();
    let claimed = {
        let retries = store.retry_table("retry").unwrap();
        retries.insert(retry_row("first", Duration::seconds(-2))).unwrap();
        retries.insert(retry_row("second", Duration::seconds(-1))).unwrap();
        let claimed = retries.claim_due(Utc::now()).unwrap();
        retries.settle(claimed[0].id).unwrap();
        claimed
    };

    let retries = store.retry_table("retry").unwrap();
    assert_eq!(retries.claimed_len(), 1);
    assert_eq!(retries.recover_claimed().unwrap(), 1);
    assert_eq!(retries.claimed_len(), 0);
    assert_eq!(retries.list().unwrap(), vec![claimed[1].clone()]);

    let again = retries.claim_due(Utc::now()).unwrap();
    assert_eq!(again, vec![claimed[1].clone()]);
}

#[test]
fn test_dead_letter_insert_and_get() {
    let (_dir, store) = create_test_store();
    let dead = store.dead_letter_table("dead").unwrap();
    let stored = dead
        .insert(DeadLetterRecord {
            id: 0,
            value: "{\"link\":\"x\"}".into(),
            topic: "t".into(),
            partition: 2,
            kafka_offset: 11,
            retry_count: 3,
            created_at: Utc::now(),
        })
        .unwrap();

    let fetched = dead.get(stored.id).unwrap().unwrap();
    assert_eq!(fetched, stored);
    assert_eq!(dead.len(), 1);
    assert!(dead.get(stored.id + 1000).unwrap().is_none());
}

#[test]
fn test_tables_are_isolated() {
    let (_dir, store) = create_test_store();
    let retries = store.retry_table("retry").unwrap();
    let dead = store.dead_letter_table("dead").unwrap();
    retries.insert(retry_row("a", Duration::seconds(-1))).unwrap();
    assert!(dead.list().unwrap().is_empty());
}
