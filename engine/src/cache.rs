//! TTL and LRU bookkeeping for cached read data.
//!
//! [`CacheIndex`] is the pure core of the cache manager: it decides what is
//! expired and what to evict, given explicit `now` inputs. Durable mirroring
//! and the periodic sweep task live in the client crate.
//!
//! Invariants:
//! - a read never returns an entry where `now >= expires_at`
//! - with `max_entries` set for an entity type, the live entry count for
//!   that type never exceeds it; least-recently-accessed entries go first

use crate::{EntityType, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// TTL applied to entity types without an explicit policy.
pub const DEFAULT_TTL_MS: Timestamp = 60_000;

/// Eviction priority hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CachePriority {
    Low,
    #[default]
    Medium,
    High,
}

/// Per-entity-type cache policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachePolicy {
    pub entity_type: EntityType,
    /// Time-to-live in milliseconds
    pub ttl: Timestamp,
    /// Capacity bound for live entries of this type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,
    pub priority: CachePriority,
}

impl CachePolicy {
    pub fn new(entity_type: impl Into<EntityType>, ttl: Timestamp) -> Self {
        Self {
            entity_type: entity_type.into(),
            ttl,
            max_entries: None,
            priority: CachePriority::default(),
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn with_priority(mut self, priority: CachePriority) -> Self {
        self.priority = priority;
        self
    }

    /// The implicit policy for entity types never configured: short TTL,
    /// medium priority, no capacity bound.
    pub fn implicit(entity_type: impl Into<EntityType>) -> Self {
        Self::new(entity_type, DEFAULT_TTL_MS)
    }
}

/// One cached entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub entity_type: EntityType,
    pub data: Value,
    /// When the entry was written
    pub timestamp: Timestamp,
    pub ttl: Timestamp,
    pub expires_at: Timestamp,
    pub access_count: u64,
    pub last_accessed: Timestamp,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

/// In-memory cache state with TTL and per-type LRU eviction.
///
/// Keys iterate in order (BTreeMap) so the durable mirror is deterministic.
#[derive(Debug, Clone, Default)]
pub struct CacheIndex {
    entries: BTreeMap<String, CacheEntry>,
    policies: HashMap<EntityType, CachePolicy>,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policies(policies: Vec<CachePolicy>) -> Self {
        let mut index = Self::new();
        for policy in policies {
            index.set_policy(policy);
        }
        index
    }

    pub fn set_policy(&mut self, policy: CachePolicy) {
        self.policies.insert(policy.entity_type.clone(), policy);
    }

    /// The policy for an entity type, falling back to the implicit default.
    pub fn policy_for(&self, entity_type: &str) -> CachePolicy {
        self.policies
            .get(entity_type)
            .cloned()
            .unwrap_or_else(|| CachePolicy::implicit(entity_type))
    }

    /// Write an entry. Returns the keys evicted to stay within the type's
    /// capacity bound.
    pub fn put(
        &mut self,
        key: impl Into<String>,
        entity_type: impl Into<EntityType>,
        data: Value,
        now: Timestamp,
    ) -> Vec<String> {
        let key = key.into();
        let entity_type = entity_type.into();
        let policy = self.policy_for(&entity_type);

        let entry = CacheEntry {
            key: key.clone(),
            entity_type: entity_type.clone(),
            data,
            timestamp: now,
            ttl: policy.ttl,
            expires_at: now + policy.ttl,
            access_count: 0,
            last_accessed: now,
        };
        self.entries.insert(key, entry);

        self.enforce_bound(&entity_type, now)
    }

    /// Read an entry. An expired entry is a miss and is evicted; a hit bumps
    /// the access statistics.
    pub fn get(&mut self, key: &str, now: Timestamp) -> Option<&Value> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_accessed = now;
        Some(&entry.data)
    }

    /// Remove an entry outright.
    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Total entries, including not-yet-swept expired ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live (non-expired) entries for one entity type.
    pub fn live_count(&self, entity_type: &str, now: Timestamp) -> usize {
        self.entries
            .values()
            .filter(|e| e.entity_type == entity_type && !e.is_expired(now))
            .count()
    }

    /// Remove all expired entries and re-enforce every policy's capacity
    /// bound. Returns the evicted keys. Idempotent for a fixed `now`.
    pub fn sweep(&mut self, now: Timestamp) -> Vec<String> {
        let mut evicted: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &evicted {
            self.entries.remove(key);
        }

        let types: Vec<EntityType> = self.policies.keys().cloned().collect();
        for entity_type in types {
            evicted.extend(self.enforce_bound(&entity_type, now));
        }
        evicted
    }

    /// Evict least-recently-accessed entries of one type until the live
    /// count is back at the policy bound.
    fn enforce_bound(&mut self, entity_type: &str, now: Timestamp) -> Vec<String> {
        let Some(max_entries) = self.policy_for(entity_type).max_entries else {
            return Vec::new();
        };

        let mut evicted = Vec::new();
        while self.live_count(entity_type, now) > max_entries {
            let lru = self
                .entries
                .values()
                .filter(|e| e.entity_type == entity_type && !e.is_expired(now))
                .min_by_key(|e| (e.last_accessed, e.key.clone()))
                .map(|e| e.key.clone());
            match lru {
                Some(key) => {
                    self.entries.remove(&key);
                    evicted.push(key);
                }
                None => break,
            }
        }
        evicted
    }

    /// Export as an ordered `[key, entry]` list for durable mirroring.
    pub fn export(&self) -> Vec<(String, CacheEntry)> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }

    /// Replace all entries from a previously exported list. Policies are
    /// not part of the mirror and are unaffected.
    pub fn import(&mut self, pairs: Vec<(String, CacheEntry)>) {
        self.entries = pairs.into_iter().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn index_with(policy: CachePolicy) -> CacheIndex {
        CacheIndex::with_policies(vec![policy])
    }

    #[test]
    fn ttl_boundary() {
        let mut index = index_with(CachePolicy::new("order", 1000));
        index.put("order:1", "order", json!({"total": 10}), 0);

        assert!(index.get("order:1", 999).is_some());
        assert!(index.get("order:1", 1000).is_none());
        // The expired entry was evicted by the read.
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn hit_bumps_access_stats() {
        let mut index = index_with(CachePolicy::new("order", 1000));
        index.put("order:1", "order", json!({}), 0);

        index.get("order:1", 10);
        index.get("order:1", 20);

        let (_, entry) = &index.export()[0];
        assert_eq!(entry.access_count, 2);
        assert_eq!(entry.last_accessed, 20);
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let mut index = index_with(CachePolicy::new("product", 10_000).with_max_entries(2));

        index.put("product:a", "product", json!({"name": "A"}), 0);
        index.put("product:b", "product", json!({"name": "B"}), 1);
        // Touch A so B becomes least recently accessed.
        index.get("product:a", 5);

        let evicted = index.put("product:c", "product", json!({"name": "C"}), 10);
        assert_eq!(evicted, vec!["product:b".to_string()]);
        assert_eq!(index.live_count("product", 10), 2);
        assert!(index.get("product:a", 11).is_some());
        assert!(index.get("product:c", 11).is_some());
    }

    #[test]
    fn bound_only_counts_live_entries() {
        let mut index = index_with(CachePolicy::new("product", 100).with_max_entries(2));

        index.put("product:a", "product", json!({}), 0);
        index.put("product:b", "product", json!({}), 0);
        // Both expire at t=100; a new write then fits without eviction of
        // anything live.
        let evicted = index.put("product:c", "product", json!({}), 200);
        assert!(evicted.is_empty());
        assert_eq!(index.live_count("product", 200), 1);
    }

    #[test]
    fn unknown_type_gets_implicit_policy() {
        let mut index = CacheIndex::new();
        index.put("misc:1", "misc", json!({}), 0);

        let policy = index.policy_for("misc");
        assert_eq!(policy.ttl, DEFAULT_TTL_MS);
        assert_eq!(policy.priority, CachePriority::Medium);
        assert!(policy.max_entries.is_none());

        assert!(index.get("misc:1", DEFAULT_TTL_MS - 1).is_some());
        assert!(index.get("misc:1", DEFAULT_TTL_MS).is_none());
    }

    #[test]
    fn sweep_removes_expired_across_types() {
        let mut index = CacheIndex::with_policies(vec![
            CachePolicy::new("order", 1000),
            CachePolicy::new("product", 5000),
        ]);
        index.put("order:1", "order", json!({}), 0);
        index.put("product:1", "product", json!({}), 0);

        let evicted = index.sweep(2000);
        assert_eq!(evicted, vec!["order:1".to_string()]);
        assert_eq!(index.len(), 1);

        // Overlapping sweeps are harmless.
        assert!(index.sweep(2000).is_empty());
    }

    #[test]
    fn sweep_reenforces_bounds() {
        let mut index = index_with(CachePolicy::new("product", 10_000).with_max_entries(1));
        // Imported mirrors may exceed the bound; sweep restores it.
        index.import(vec![
            (
                "product:a".into(),
                CacheEntry {
                    key: "product:a".into(),
                    entity_type: "product".into(),
                    data: json!({}),
                    timestamp: 0,
                    ttl: 10_000,
                    expires_at: 10_000,
                    access_count: 0,
                    last_accessed: 0,
                },
            ),
            (
                "product:b".into(),
                CacheEntry {
                    key: "product:b".into(),
                    entity_type: "product".into(),
                    data: json!({}),
                    timestamp: 0,
                    ttl: 10_000,
                    expires_at: 10_000,
                    access_count: 0,
                    last_accessed: 5,
                },
            ),
        ]);

        let evicted = index.sweep(100);
        assert_eq!(evicted, vec!["product:a".to_string()]); // older access
        assert_eq!(index.live_count("product", 100), 1);
    }

    #[test]
    fn export_is_ordered_and_roundtrips() {
        let mut index = index_with(CachePolicy::new("order", 1000));
        index.put("order:2", "order", json!({"n": 2}), 0);
        index.put("order:1", "order", json!({"n": 1}), 0);

        let pairs = index.export();
        let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["order:1", "order:2"]);

        let mut restored = index_with(CachePolicy::new("order", 1000));
        restored.import(pairs);
        assert!(restored.get("order:1", 500).is_some());
        assert!(restored.get("order:2", 500).is_some());
    }

    #[test]
    fn entry_serialization_roundtrip() {
        let entry = CacheEntry {
            key: "order:1".into(),
            entity_type: "order".into(),
            data: json!({"total": 10}),
            timestamp: 1,
            ttl: 1000,
            expires_at: 1001,
            access_count: 3,
            last_accessed: 500,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("expiresAt"));
        let parsed: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, parsed);
    }
}
