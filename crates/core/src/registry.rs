//! Index of known strategy kinds and the live instance for each
//! `(strategy type, policy name)` key.
//!
//! The registry performs no locking and no cluster calls. `MetricEnforcer`
//! owns it behind a mutex and acts on the decisions it returns.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;

use crate::strategy::{Strategy, StrategyKey};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementStatus {
    #[default]
    Unenforced,
    Enforced,
}

#[derive(Clone, Debug)]
pub struct Slot {
    pub strategy: Arc<dyn Strategy>,
    pub generation: u64,
    pub status: EnforcementStatus,
    /// Set when an enforce attempt failed after it may have mutated targets.
    pub needs_cleanup: bool,
}

impl Slot {
    pub fn is_enforced(&self) -> bool {
        self.status == EnforcementStatus::Enforced
    }

    /// Whether dropping this instance must be preceded by a cleanup call.
    pub fn requires_cleanup(&self) -> bool {
        self.is_enforced() || self.needs_cleanup
    }
}

/// Enforcement left behind by an instance that is no longer registered.
#[derive(Clone, Debug)]
pub struct PendingCleanup {
    pub strategy: Arc<dyn Strategy>,
    pub attempts: u32,
}

#[derive(Clone, Debug)]
pub struct SnapshotEntry {
    pub key: StrategyKey,
    pub strategy: Arc<dyn Strategy>,
    pub generation: u64,
}

#[derive(Debug)]
pub enum Insertion {
    Inserted,
    Unchanged,
    Replaced(Slot),
    UnknownType,
}

#[derive(Debug, Default)]
pub struct StrategyRegistry {
    types: BTreeSet<String>,
    instances: BTreeMap<StrategyKey, Slot>,
    pending: BTreeMap<StrategyKey, PendingCleanup>,
    next_generation: u64,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the type was already known.
    pub fn register_type(&mut self, strategy_type: &str) -> bool {
        self.types.insert(strategy_type.to_owned())
    }

    /// Forgets the type and hands back every instance of it that was live.
    pub fn unregister_type(&mut self, strategy_type: &str) -> Vec<(StrategyKey, Slot)> {
        if !self.types.remove(strategy_type) {
            return Vec::new();
        }

        let keys: Vec<StrategyKey> = self
            .instances
            .keys()
            .filter(|key| key.strategy_type == strategy_type)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.instances.remove(&key).map(|slot| (key, slot)))
            .collect()
    }

    pub fn is_registered(&self, strategy_type: &str) -> bool {
        self.types.contains(strategy_type)
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.types.iter().cloned().collect()
    }

    pub fn insert(&mut self, strategy: Arc<dyn Strategy>) -> Insertion {
        if !self.is_registered(strategy.strategy_type()) {
            return Insertion::UnknownType;
        }

        let key = StrategyKey::of(strategy.as_ref());
        if let Some(existing) = self.instances.get(&key) {
            if existing.strategy.equals(strategy.as_ref()) {
                return Insertion::Unchanged;
            }
        }

        let generation = self.allocate_generation();
        let slot = Slot {
            strategy,
            generation,
            status: EnforcementStatus::Unenforced,
            needs_cleanup: false,
        };
        match self.instances.insert(key, slot) {
            Some(previous) => Insertion::Replaced(previous),
            None => Insertion::Inserted,
        }
    }

    pub fn remove(&mut self, key: &StrategyKey) -> Option<Slot> {
        self.instances.remove(key)
    }

    pub fn get(&self, key: &StrategyKey) -> Option<&Slot> {
        self.instances.get(key)
    }

    /// The slot at `key`, only if it is still the instance installed as `generation`.
    pub fn current(&self, key: &StrategyKey, generation: u64) -> Option<&Slot> {
        self.instances.get(key).filter(|slot| slot.generation == generation)
    }

    /// Records a completed enforce or cleanup, which also settles any leftover
    /// partial enforcement. Ignored, returning `false`, when the slot was
    /// removed or replaced since `generation` was observed.
    pub fn set_status(
        &mut self,
        key: &StrategyKey,
        generation: u64,
        status: EnforcementStatus,
    ) -> bool {
        match self.instances.get_mut(key) {
            Some(slot) if slot.generation == generation => {
                slot.status = status;
                slot.needs_cleanup = false;
                true
            }
            _ => false,
        }
    }

    pub fn mark_needs_cleanup(&mut self, key: &StrategyKey, generation: u64) -> bool {
        match self.instances.get_mut(key) {
            Some(slot) if slot.generation == generation => {
                slot.needs_cleanup = true;
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Vec<SnapshotEntry> {
        self.instances
            .iter()
            .map(|(key, slot)| SnapshotEntry {
                key: key.clone(),
                strategy: Arc::clone(&slot.strategy),
                generation: slot.generation,
            })
            .collect()
    }

    pub fn instances(&self) -> impl Iterator<Item = (&StrategyKey, &Slot)> {
        self.instances.iter()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn enforced_count(&self) -> usize {
        self.instances.values().filter(|slot| slot.is_enforced()).count()
    }

    pub fn queue_cleanup(&mut self, key: StrategyKey, strategy: Arc<dyn Strategy>) {
        let attempts = self.pending.get(&key).map_or(0, |pending| pending.attempts);
        self.pending.insert(key, PendingCleanup { strategy, attempts });
    }

    pub fn pending_cleanups(&self) -> Vec<(StrategyKey, PendingCleanup)> {
        self.pending.iter().map(|(key, pending)| (key.clone(), pending.clone())).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending_cleanup(&self, key: &StrategyKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn resolve_cleanup(&mut self, key: &StrategyKey) -> bool {
        self.pending.remove(key).is_some()
    }

    pub fn record_cleanup_attempt(&mut self, key: &StrategyKey) -> u32 {
        match self.pending.get_mut(key) {
            Some(pending) => {
                pending.attempts += 1;
                pending.attempts
            }
            None => 0,
        }
    }

    fn allocate_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::Arc;

    use super::{EnforcementStatus, Insertion, StrategyRegistry};
    use crate::cache::Reader;
    use crate::errors::EvaluationError;
    use crate::strategy::{structurally_equal, Strategy, StrategyKey, Verdict};

    #[derive(Clone, Debug, PartialEq)]
    struct Threshold {
        kind: &'static str,
        policy: String,
        limit: i64,
    }

    impl Threshold {
        fn new(kind: &'static str, policy: &str, limit: i64) -> Arc<dyn Strategy> {
            Arc::new(Self { kind, policy: policy.to_owned(), limit })
        }
    }

    impl Strategy for Threshold {
        fn strategy_type(&self) -> &str {
            self.kind
        }

        fn policy_name(&self) -> &str {
            &self.policy
        }

        fn set_policy_name(&mut self, policy_name: &str) {
            self.policy = policy_name.to_owned();
        }

        fn violated(&self, _cache: &dyn Reader) -> Result<Verdict, EvaluationError> {
            Ok(Verdict::Compliant)
        }

        fn equals(&self, other: &dyn Strategy) -> bool {
            structurally_equal(self, other)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn registry_with(types: &[&str]) -> StrategyRegistry {
        let mut registry = StrategyRegistry::new();
        for strategy_type in types {
            registry.register_type(strategy_type);
        }
        registry
    }

    #[test]
    fn registering_a_type_twice_is_a_no_op() {
        let mut registry = StrategyRegistry::new();

        assert!(registry.register_type("averageUsage"));
        assert!(!registry.register_type("averageUsage"));
        assert!(registry.is_registered("averageUsage"));
        assert_eq!(registry.registered_types(), vec!["averageUsage".to_owned()]);
    }

    #[test]
    fn instances_of_unknown_types_are_rejected() {
        let mut registry = StrategyRegistry::new();

        assert!(matches!(
            registry.insert(Threshold::new("averageUsage", "policyA", 80)),
            Insertion::UnknownType
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn equal_insert_is_idempotent() {
        let mut registry = registry_with(&["averageUsage"]);

        assert!(matches!(
            registry.insert(Threshold::new("averageUsage", "policyA", 80)),
            Insertion::Inserted
        ));
        assert!(matches!(
            registry.insert(Threshold::new("averageUsage", "policyA", 80)),
            Insertion::Unchanged
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn differing_parameters_replace_the_instance_with_a_new_generation() {
        let mut registry = registry_with(&["averageUsage"]);
        registry.insert(Threshold::new("averageUsage", "policyA", 80));
        let key = StrategyKey::new("averageUsage", "policyA");
        let first_generation = registry.get(&key).expect("inserted").generation;
        assert!(registry.set_status(&key, first_generation, EnforcementStatus::Enforced));

        let Insertion::Replaced(previous) =
            registry.insert(Threshold::new("averageUsage", "policyA", 90))
        else {
            panic!("expected a replacement");
        };

        assert!(previous.is_enforced());
        assert_eq!(registry.len(), 1);
        let current = registry.get(&key).expect("replacement installed");
        assert!(current.generation > first_generation);
        assert_eq!(current.status, EnforcementStatus::Unenforced);
    }

    #[test]
    fn stale_generation_cannot_change_status() {
        let mut registry = registry_with(&["averageUsage"]);
        registry.insert(Threshold::new("averageUsage", "policyA", 80));
        let key = StrategyKey::new("averageUsage", "policyA");
        let stale = registry.get(&key).expect("inserted").generation;
        registry.insert(Threshold::new("averageUsage", "policyA", 95));

        assert!(!registry.set_status(&key, stale, EnforcementStatus::Enforced));
        assert!(registry.current(&key, stale).is_none());
        assert_eq!(registry.enforced_count(), 0);

        registry.remove(&key);
        assert!(!registry.set_status(&key, stale + 1, EnforcementStatus::Enforced));
    }

    #[test]
    fn partial_enforcement_requires_cleanup_until_settled() {
        let mut registry = registry_with(&["deschedule"]);
        registry.insert(Threshold::new("deschedule", "policyA", 80));
        let key = StrategyKey::new("deschedule", "policyA");
        let generation = registry.get(&key).expect("inserted").generation;

        assert!(registry.mark_needs_cleanup(&key, generation));
        let slot = registry.get(&key).expect("still registered");
        assert_eq!(slot.status, EnforcementStatus::Unenforced);
        assert!(slot.requires_cleanup());

        assert!(registry.set_status(&key, generation, EnforcementStatus::Unenforced));
        assert!(!registry.get(&key).expect("still registered").requires_cleanup());
        assert!(!registry.mark_needs_cleanup(&key, generation + 1));
    }

    #[test]
    fn unregistering_a_type_hands_back_its_instances() {
        let mut registry = registry_with(&["averageUsage", "deschedule"]);
        registry.insert(Threshold::new("averageUsage", "policyA", 80));
        registry.insert(Threshold::new("averageUsage", "policyB", 80));
        registry.insert(Threshold::new("deschedule", "policyA", 80));

        let removed = registry.unregister_type("averageUsage");

        assert_eq!(removed.len(), 2);
        assert!(!registry.is_registered("averageUsage"));
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister_type("averageUsage").is_empty());
    }

    #[test]
    fn pending_cleanups_track_attempts_until_resolved() {
        let mut registry = StrategyRegistry::new();
        let key = StrategyKey::new("deschedule", "policyA");
        registry.queue_cleanup(key.clone(), Threshold::new("deschedule", "policyA", 1));

        assert!(registry.has_pending_cleanup(&key));
        assert_eq!(registry.record_cleanup_attempt(&key), 1);
        registry.queue_cleanup(key.clone(), Threshold::new("deschedule", "policyA", 2));
        assert_eq!(registry.record_cleanup_attempt(&key), 2);

        assert!(registry.resolve_cleanup(&key));
        assert!(!registry.has_pending_cleanup(&key));
        assert_eq!(registry.record_cleanup_attempt(&key), 0);
    }

    #[test]
    fn snapshot_copies_every_instance() {
        let mut registry = registry_with(&["averageUsage"]);
        registry.insert(Threshold::new("averageUsage", "policyB", 1));
        registry.insert(Threshold::new("averageUsage", "policyA", 1));

        let snapshot = registry.snapshot();
        let keys: Vec<String> = snapshot.iter().map(|entry| entry.key.to_string()).collect();

        assert_eq!(keys, vec!["averageUsage/policyA", "averageUsage/policyB"]);
        registry.remove(&snapshot[0].key);
        assert_eq!(snapshot.len(), 2);
    }
}
