//! Edge case tests for tillsync-engine
//!
//! These tests cover boundary conditions and unusual inputs.

use serde_json::json;
use tillsync_engine::{
    auto_resolve, backoff_delay_ms, detect_conflict, export_conflicts, import_conflicts,
    CacheIndex, CachePolicy, Conflict, ConflictKind, EntityState, ErrorClass, OperationKind,
    ResolutionStrategy, SyncOperation,
};

fn order_conflict(local: &EntityState, remote: &EntityState) -> Option<Conflict> {
    detect_conflict(
        "cfl-1",
        "order",
        "order-1",
        OperationKind::OrderUpdate,
        local,
        Some(remote),
        1000,
    )
}

// ============================================================================
// Conflict Edge Cases
// ============================================================================

#[test]
fn both_sides_deleted_is_not_a_conflict() {
    let local = EntityState::tombstone(3, 100);
    let remote = EntityState::tombstone(3, 200);
    assert!(order_conflict(&local, &remote).is_none());
}

#[test]
fn tombstones_with_different_versions_conflict() {
    let local = EntityState::tombstone(2, 100);
    let remote = EntityState::tombstone(5, 200);
    let conflict = order_conflict(&local, &remote).unwrap();
    assert_eq!(conflict.kind, ConflictKind::VersionMismatch);
}

#[test]
fn unicode_payloads_survive_merge_and_export() {
    let local = EntityState::new(json!({"note": "居酒屋 🍶", "table": null}), 2, 300);
    let remote = EntityState::new(json!({"note": "old", "table": "テーブル5"}), 2, 200);

    let mut conflict = order_conflict(&local, &remote).unwrap();
    let resolution = conflict.resolve(ResolutionStrategy::Merge, "auto", 1000);
    assert_eq!(
        resolution.data,
        Some(json!({"note": "居酒屋 🍶", "table": "テーブル5"}))
    );

    let exported = export_conflicts(std::slice::from_ref(&conflict)).unwrap();
    let imported = import_conflicts(&exported).unwrap();
    assert_eq!(imported[0], conflict);
}

#[test]
fn merge_with_empty_local_object_keeps_remote() {
    let local = EntityState::new(json!({}), 1, 500);
    let remote = EntityState::new(json!({"total": 42}), 1, 100);

    let mut conflict = order_conflict(&local, &remote).unwrap();
    let resolution = conflict.resolve(ResolutionStrategy::Merge, "auto", 1000);
    assert_eq!(resolution.data, Some(json!({"total": 42})));
}

#[test]
fn very_large_payloads() {
    let big = "x".repeat(1024 * 1024);
    let local = EntityState::new(json!({"receipt": big}), 1, 100);
    let remote = EntityState::new(json!({"receipt": "small"}), 2, 50);

    let mut conflict = order_conflict(&local, &remote).unwrap();
    let resolution = conflict.resolve(ResolutionStrategy::LastWriteWins, "auto", 1000);
    // Local timestamp is greater, so the megabyte payload wins intact.
    assert_eq!(
        resolution.data.unwrap()["receipt"].as_str().unwrap().len(),
        1024 * 1024
    );
}

#[test]
fn empty_conflict_list_roundtrips() {
    let exported = export_conflicts(&[]).unwrap();
    assert_eq!(exported, "[]");
    assert!(import_conflicts(&exported).unwrap().is_empty());
    assert_eq!(auto_resolve(&mut [], 0), 0);
}

// ============================================================================
// Cache Edge Cases
// ============================================================================

#[test]
fn zero_ttl_entries_are_never_readable() {
    let mut index = CacheIndex::with_policies(vec![CachePolicy::new("flash", 0)]);
    index.put("flash:1", "flash", json!({}), 100);
    // expires_at == write time, and reads at now >= expires_at miss.
    assert!(index.get("flash:1", 100).is_none());
}

#[test]
fn max_entries_of_zero_keeps_nothing_live() {
    let mut index =
        CacheIndex::with_policies(vec![CachePolicy::new("order", 1000).with_max_entries(0)]);
    let evicted = index.put("order:1", "order", json!({}), 0);
    assert_eq!(evicted, vec!["order:1".to_string()]);
    assert_eq!(index.live_count("order", 0), 0);
}

#[test]
fn overwriting_a_key_does_not_grow_the_type_count() {
    let mut index =
        CacheIndex::with_policies(vec![CachePolicy::new("order", 1000).with_max_entries(1)]);
    index.put("order:1", "order", json!({"v": 1}), 0);
    let evicted = index.put("order:1", "order", json!({"v": 2}), 10);
    assert!(evicted.is_empty());
    assert_eq!(index.get("order:1", 20), Some(&json!({"v": 2})));
}

#[test]
fn eviction_tiebreak_is_deterministic() {
    let mut index =
        CacheIndex::with_policies(vec![CachePolicy::new("order", 1000).with_max_entries(2)]);
    // Identical last_accessed stamps; the smaller key goes first.
    index.put("order:a", "order", json!({}), 0);
    index.put("order:b", "order", json!({}), 0);
    let evicted = index.put("order:c", "order", json!({}), 0);
    assert_eq!(evicted, vec!["order:a".to_string()]);
}

// ============================================================================
// Queue Ordering & Backoff Edge Cases
// ============================================================================

#[test]
fn sort_is_stable_across_scopes() {
    let mk = |id: &str, scope: &str, at: u64| {
        SyncOperation::new(id, OperationKind::OrderCreate, "o", json!({}), scope, at)
    };
    let mut ops = vec![
        mk("op-3", "b", 300),
        mk("op-1", "a", 100),
        mk("op-2", "b", 100),
    ];
    ops.sort();
    let ids: Vec<&str> = ops.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, vec!["op-1", "op-2", "op-3"]);
}

#[test]
fn backoff_zero_base_never_waits() {
    assert_eq!(backoff_delay_ms(0, 0, 30_000), 0);
    assert_eq!(backoff_delay_ms(0, 10, 30_000), 0);
}

#[test]
fn classification_covers_the_whole_status_space() {
    for status in 100u16..=599 {
        // Every status maps to exactly one class without panicking.
        let class = ErrorClass::from_status(Some(status));
        match status {
            408 => assert_eq!(class, ErrorClass::Transient),
            409 | 429 => assert_eq!(class, ErrorClass::Retryable),
            500..=599 => assert_eq!(class, ErrorClass::Transient),
            400..=499 => assert_eq!(class, ErrorClass::Validation),
            _ => assert_eq!(class, ErrorClass::Permanent),
        }
    }
}
