//! Behaviour every [`DelayStore`] backend must share. Each backend's test
//! module runs these against a fresh, empty store.

use super::DelayStore;

const FAR_FUTURE: i64 = i64::MAX / 2;

/// Everything still in the active set, leasing it far out of reach.
async fn drain(store: &dyn DelayStore) -> Vec<String> {
    store.claim_due(FAR_FUTURE, FAR_FUTURE, 100).await.unwrap()
}

pub(super) async fn put_replaces_pending_message(store: &dyn DelayStore) {
    assert_eq!(store.put("s1", "a", 10).await.unwrap(), None);
    assert_eq!(store.put("s1", "b", 20).await.unwrap(), Some("a".into()));

    assert_eq!(store.get("s1").await.unwrap(), Some("b".into()));
    assert_eq!(drain(store).await, vec!["b".to_string()]);
}

pub(super) async fn remove_clears_both_structures(store: &dyn DelayStore) {
    store.put("s1", "a", 10).await.unwrap();
    assert_eq!(store.remove("s1").await.unwrap(), Some("a".into()));
    assert_eq!(store.remove("s1").await.unwrap(), None);

    assert_eq!(store.get("s1").await.unwrap(), None);
    assert!(drain(store).await.is_empty());
}

pub(super) async fn claim_due_respects_score_limit_and_leases(store: &dyn DelayStore) {
    store.put("s1", "a", 10).await.unwrap();
    store.put("s2", "b", 20).await.unwrap();
    store.put("s3", "c", 30).await.unwrap();
    store.put("s4", "d", 100).await.unwrap();

    let due = store.claim_due(50, 1000, 2).await.unwrap();
    assert_eq!(due, vec!["a".to_string(), "b".to_string()]);

    // Leased entries are not handed out again before the lease expires.
    let due = store.claim_due(50, 1000, 10).await.unwrap();
    assert_eq!(due, vec!["c".to_string()]);

    // Once it has, they come back, after anything due earlier.
    let due = store.claim_due(1000, 2000, 10).await.unwrap();
    assert_eq!(due, vec!["d", "a", "b", "c"]);
    assert_eq!(store.get("s1").await.unwrap(), Some("a".into()));
}

pub(super) async fn ack_keeps_newer_lookup_entry(store: &dyn DelayStore) {
    store.put("s1", "old", 10).await.unwrap();
    store.claim_due(10, 500, 10).await.unwrap();
    store.put("s1", "new", 20).await.unwrap();

    store.ack("s1", "old").await.unwrap();

    assert_eq!(store.get("s1").await.unwrap(), Some("new".into()));
    assert_eq!(drain(store).await, vec!["new".to_string()]);
}

pub(super) async fn ack_clears_delivered_message(store: &dyn DelayStore) {
    store.put("s1", "a", 10).await.unwrap();
    store.claim_due(10, 500, 10).await.unwrap();
    store.ack("s1", "a").await.unwrap();

    assert_eq!(store.get("s1").await.unwrap(), None);
    assert!(drain(store).await.is_empty());
}

pub(super) async fn requeue_refuses_superseded_message(store: &dyn DelayStore) {
    store.put("s1", "old", 10).await.unwrap();
    assert!(store.requeue("s1", "old", "retry", 50).await.unwrap());
    assert_eq!(store.get("s1").await.unwrap(), Some("retry".into()));

    store.remove("s1").await.unwrap();
    store.put("s2", "x", 10).await.unwrap();
    assert!(!store.requeue("s1", "retry", "retry2", 90).await.unwrap());
    assert_eq!(store.get("s1").await.unwrap(), None);
    assert_eq!(drain(store).await, vec!["x".to_string()]);
}

pub(super) async fn requeue_drops_claimed_payload_when_replaced(store: &dyn DelayStore) {
    store.put("s1", "old", 10).await.unwrap();
    store.claim_due(10, 500, 10).await.unwrap();
    store.put("s1", "new", 900).await.unwrap();

    assert!(!store.requeue("s1", "old", "retry", 50).await.unwrap());
    assert_eq!(store.get("s1").await.unwrap(), Some("new".into()));
    assert_eq!(drain(store).await, vec!["new".to_string()]);
}

pub(super) async fn dead_letter_moves_out_of_active_structures(store: &dyn DelayStore) {
    store.put("s1", "a", 10).await.unwrap();
    store.dead_letter(Some("s1"), "a", "a-dead", 99).await.unwrap();
    // Undecodable payloads carry no sandbox id.
    store.put("s2", "garbage", 10).await.unwrap();
    store.dead_letter(None, "garbage", "garbage", 100).await.unwrap();

    assert_eq!(store.get("s1").await.unwrap(), None);
    // Only the lookup entry of a known id is cleared.
    assert_eq!(store.get("s2").await.unwrap(), Some("garbage".into()));
    assert!(drain(store).await.is_empty());
    assert_eq!(
        store.dead_letters(10).await.unwrap(),
        vec!["garbage".to_string(), "a-dead".to_string()]
    );
    assert_eq!(store.dead_letters(1).await.unwrap(), vec!["garbage".to_string()]);
    assert!(store.dead_letters(0).await.unwrap().is_empty());
}
