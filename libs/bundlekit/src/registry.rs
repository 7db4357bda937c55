//! Module Registry - authoritative record of every known module
//!
//! Pure data plus invariant enforcement. Readers always receive clones so no
//! caller can hold a reference into the lock while another task writes.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lifecycle::{ModuleState, TransitionKind};
use crate::model::{ActivationPolicy, IdentityKey, ModuleId, ModuleRecord};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown module '{0}'")]
    UnknownModule(ModuleId),
    #[error("module '{0}' is already registered")]
    AlreadyRegistered(ModuleId),
}

/// Serializable view of the registry, consumed by session persistence.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub modules: Vec<ModuleRecord>,
}

impl RegistrySnapshot {
    pub fn get(&self, id: &ModuleId) -> Option<&ModuleRecord> {
        self.modules.iter().find(|m| &m.id == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ModuleId> + '_ {
        self.modules.iter().map(|m| &m.id)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[derive(Default)]
struct RegistryInner {
    // insertion order; the sorter uses it as its tie-break
    order: Vec<ModuleId>,
    records: HashMap<ModuleId, ModuleRecord>,
}

/// Central registry shared by handle (`Arc<ModuleRegistry>`) between the
/// orchestrator, the transition machine and the event pump.
#[derive(Default)]
pub struct ModuleRegistry {
    inner: RwLock<RegistryInner>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        let ids: Vec<&str> = inner.order.iter().map(|id| id.as_str()).collect();
        f.debug_struct("ModuleRegistry")
            .field("modules_count", &inner.order.len())
            .field("modules", &ids)
            .finish()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a previously taken snapshot.
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let registry = Self::new();
        registry.restore(snapshot);
        registry
    }

    /// Register a new module in the `Uninstalled` state.
    pub fn register(
        &self,
        id: ModuleId,
        identity_key: IdentityKey,
        policy: ActivationPolicy,
    ) -> Result<(), RegistryError> {
        self.insert(ModuleRecord::new(id, identity_key).with_policy(policy))
    }

    /// Register a module with a fully populated record (e.g. restored from a manifest).
    pub fn insert(&self, record: ModuleRecord) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        if inner.records.contains_key(&record.id) {
            return Err(RegistryError::AlreadyRegistered(record.id));
        }
        inner.order.push(record.id.clone());
        inner.records.insert(record.id.clone(), record);
        Ok(())
    }

    /// Remove a module from the registry
    pub fn unregister(&self, id: &ModuleId) -> Result<ModuleRecord, RegistryError> {
        let mut inner = self.inner.write();
        let record = inner
            .records
            .remove(id)
            .ok_or_else(|| RegistryError::UnknownModule(id.clone()))?;
        inner.order.retain(|m| m != id);
        Ok(record)
    }

    pub fn get(&self, id: &ModuleId) -> Option<ModuleRecord> {
        self.inner.read().records.get(id).cloned()
    }

    pub fn state_of(&self, id: &ModuleId) -> Option<ModuleState> {
        self.inner.read().records.get(id).map(|r| r.state)
    }

    pub fn contains(&self, id: &ModuleId) -> bool {
        self.inner.read().records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All module ids in registration order.
    pub fn ids(&self) -> Vec<ModuleId> {
        self.inner.read().order.clone()
    }

    /// A consistent copy of every record, in registration order.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.read();
        let modules = inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect();
        RegistrySnapshot { modules }
    }

    /// Replace the whole content with `snapshot`.
    ///
    /// In-flight markers are dropped: nothing survives a restart mid-transition.
    pub fn restore(&self, snapshot: RegistrySnapshot) {
        let mut inner = self.inner.write();
        inner.order.clear();
        inner.records.clear();
        for mut record in snapshot.modules {
            if inner.records.contains_key(&record.id) {
                tracing::warn!(module = %record.id, "duplicate entry in snapshot ignored");
                continue;
            }
            record.transition.in_flight = None;
            inner.order.push(record.id.clone());
            inner.records.insert(record.id.clone(), record);
        }
    }

    /// Record the activation flag. The registry never decides when it changes.
    pub fn set_activated(&self, id: &ModuleId, activated: bool) -> Result<(), RegistryError> {
        self.with_record_mut(id, |r| r.activated = activated)
    }

    pub fn set_identity_key(&self, id: &ModuleId, key: IdentityKey) -> Result<(), RegistryError> {
        self.with_record_mut(id, |r| r.identity_key = key)
    }

    pub fn set_activation_policy(
        &self,
        id: &ModuleId,
        policy: ActivationPolicy,
    ) -> Result<(), RegistryError> {
        self.with_record_mut(id, |r| r.activation_policy = policy)
    }

    /// Queue a transition the job layer intends to run later.
    pub fn add_pending(&self, id: &ModuleId, kind: TransitionKind) -> Result<(), RegistryError> {
        self.with_record_mut(id, |r| {
            r.transition.pending.insert(kind);
        })
    }

    pub fn pending(&self, id: &ModuleId) -> Vec<TransitionKind> {
        self.inner
            .read()
            .records
            .get(id)
            .map(|r| r.transition.pending.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Modules currently in `state`, in registration order.
    pub fn modules_in(&self, state: ModuleState) -> Vec<ModuleId> {
        self.filter_ids(|r| r.state == state)
    }

    pub fn activated_ids(&self) -> Vec<ModuleId> {
        self.filter_ids(|r| r.activated)
    }

    fn filter_ids(&self, pred: impl Fn(&ModuleRecord) -> bool) -> Vec<ModuleId> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter(|id| inner.records.get(*id).is_some_and(&pred))
            .cloned()
            .collect()
    }

    /// Run `f` on the record under the exclusive lock.
    ///
    /// Lifecycle fields are only written through here by the transition machine.
    pub(crate) fn with_record_mut<R>(
        &self,
        id: &ModuleId,
        f: impl FnOnce(&mut ModuleRecord) -> R,
    ) -> Result<R, RegistryError> {
        let mut inner = self.inner.write();
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownModule(id.clone()))?;
        Ok(f(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(ids: &[&str]) -> ModuleRegistry {
        let registry = ModuleRegistry::new();
        for id in ids {
            registry
                .register(
                    ModuleId::new(id),
                    IdentityKey::new(*id, "1.0"),
                    ActivationPolicy::Eager,
                )
                .unwrap();
        }
        registry
    }

    #[test]
    fn register_keeps_insertion_order() {
        let registry = registry_with(&["c", "a", "b"]);
        let ids: Vec<String> = registry.ids().iter().map(|i| i.to_string()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(
            registry.state_of(&"a".into()),
            Some(ModuleState::Uninstalled)
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = registry_with(&["a"]);
        let err = registry
            .register("a".into(), IdentityKey::empty(), ActivationPolicy::Eager)
            .unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered("a".into()));
    }

    #[test]
    fn unknown_module_errors() {
        let registry = registry_with(&["a"]);
        assert!(matches!(
            registry.set_activated(&"zzz".into(), true),
            Err(RegistryError::UnknownModule(_))
        ));
        assert!(registry.unregister(&"zzz".into()).is_err());
    }

    #[test]
    fn unregister_removes_from_order() {
        let registry = registry_with(&["a", "b", "c"]);
        registry.unregister(&"b".into()).unwrap();
        assert_eq!(registry.ids(), vec![ModuleId::new("a"), ModuleId::new("c")]);
        assert!(!registry.contains(&"b".into()));
    }

    #[test]
    fn snapshot_roundtrips_through_json() {
        let registry = registry_with(&["a", "b"]);
        registry.set_activated(&"a".into(), true).unwrap();
        registry.add_pending(&"b".into(), TransitionKind::Start).unwrap();

        let snapshot = registry.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: RegistrySnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);

        let restored = ModuleRegistry::from_snapshot(back);
        assert_eq!(restored.activated_ids(), vec![ModuleId::new("a")]);
        assert_eq!(restored.pending(&"b".into()), vec![TransitionKind::Start]);
    }

    #[test]
    fn restore_drops_in_flight_markers() {
        let registry = registry_with(&["a"]);
        registry
            .with_record_mut(&"a".into(), |r| {
                r.state = ModuleState::Starting;
                r.transition.in_flight = Some(crate::model::InFlight {
                    kind: TransitionKind::Start,
                    from: ModuleState::Resolved,
                    target: ModuleState::Active,
                });
            })
            .unwrap();

        let restored = ModuleRegistry::from_snapshot(registry.snapshot());
        let record = restored.get(&"a".into()).unwrap();
        assert_eq!(record.state, ModuleState::Starting);
        assert!(record.transition.in_flight.is_none());
    }

    #[test]
    fn modules_in_filters_by_state() {
        let registry = registry_with(&["a", "b"]);
        registry
            .with_record_mut(&"b".into(), |r| r.state = ModuleState::Resolved)
            .unwrap();
        assert_eq!(
            registry.modules_in(ModuleState::Resolved),
            vec![ModuleId::new("b")]
        );
        assert_eq!(
            registry.modules_in(ModuleState::Uninstalled),
            vec![ModuleId::new("a")]
        );
    }
}
