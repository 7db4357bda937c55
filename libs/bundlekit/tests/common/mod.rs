#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bundlekit::runtime::{channel, EventReceiver, EventSender};
use bundlekit::{
    async_trait, ActivationPolicy, Capability, IdentityKey, ModuleId, ModuleRecord,
    ModuleRegistry, ModuleRuntime, ModuleState, Orchestrator, OrchestratorConfig,
    RequirementSource, RuntimeFailure, RuntimeOutcome, TransitionKind,
};
use parking_lot::Mutex;

/// Requirement metadata held in memory. Every module provides `bundle:<id>`.
#[derive(Default)]
pub struct Requirements {
    requires: HashMap<ModuleId, Vec<Capability>>,
    workspace_keys: HashMap<ModuleId, IdentityKey>,
}

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requires(mut self, module: &str, deps: &[&str]) -> Self {
        self.requires
            .entry(module.into())
            .or_default()
            .extend(deps.iter().map(|d| Capability::module(d)));
        self
    }

    pub fn workspace_key(mut self, module: &str, name: &str, version: &str) -> Self {
        self.workspace_keys
            .insert(module.into(), IdentityKey::new(name, version));
        self
    }
}

impl RequirementSource for Requirements {
    fn requirements(&self, module: &ModuleId) -> Vec<Capability> {
        self.requires.get(module).cloned().unwrap_or_default()
    }

    fn capabilities(&self, module: &ModuleId) -> Vec<Capability> {
        vec![Capability::module(module.as_str())]
    }

    fn workspace_key(&self, module: &ModuleId) -> Option<IdentityKey> {
        self.workspace_keys.get(module).cloned()
    }
}

/// Runtime double that records every call it receives.
#[derive(Default)]
pub struct RecordingRuntime {
    calls: Mutex<Vec<(ModuleId, TransitionKind)>>,
    hangs: HashSet<(ModuleId, TransitionKind)>,
    failures: HashMap<(ModuleId, TransitionKind), RuntimeFailure>,
    refresh_failures: HashMap<ModuleId, RuntimeFailure>,
    hold_refreshes: bool,
    events: Mutex<Option<EventSender>>,
}

impl RecordingRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// `kind` on `module` never returns.
    pub fn hang_on(mut self, module: &str, kind: TransitionKind) -> Self {
        self.hangs.insert((module.into(), kind));
        self
    }

    pub fn fail_on(mut self, module: &str, kind: TransitionKind, failure: RuntimeFailure) -> Self {
        self.failures.insert((module.into(), kind), failure);
        self
    }

    /// Accept the refresh of `module`, then confirm it as failed.
    pub fn fail_refresh_of(mut self, module: &str, failure: RuntimeFailure) -> Self {
        self.refresh_failures.insert(module.into(), failure);
        self
    }

    /// Accept refreshes but never confirm them.
    pub fn hold_refreshes(mut self) -> Self {
        self.hold_refreshes = true;
        self
    }

    /// Refreshes are confirmed through `events` right after they are accepted.
    pub fn confirm_refreshes(&self, events: EventSender) {
        *self.events.lock() = Some(events);
    }

    pub fn calls(&self) -> Vec<(ModuleId, TransitionKind)> {
        self.calls.lock().clone()
    }

    pub fn calls_of(&self, kind: TransitionKind) -> Vec<ModuleId> {
        self.calls
            .lock()
            .iter()
            .filter(|(_, k)| *k == kind)
            .map(|(m, _)| m.clone())
            .collect()
    }
}

#[async_trait]
impl ModuleRuntime for RecordingRuntime {
    async fn execute(
        &self,
        module: &ModuleId,
        kind: TransitionKind,
    ) -> Result<RuntimeOutcome, RuntimeFailure> {
        self.calls.lock().push((module.clone(), kind));
        if let Some(failure) = self.failures.get(&(module.clone(), kind)) {
            return Err(failure.clone());
        }
        if self.hangs.contains(&(module.clone(), kind)) {
            std::future::pending::<()>().await;
        }
        if kind == TransitionKind::Refresh && !self.hold_refreshes {
            let events = self.events.lock().clone();
            if let Some(events) = events {
                let confirmation = match self.refresh_failures.get(module) {
                    Some(failure) => Err(failure.clone()),
                    None => Ok(RuntimeOutcome::done()),
                };
                events.refresh_completed(module.clone(), confirmation);
            }
        }
        Ok(RuntimeOutcome::done())
    }
}

pub fn record(id: &str, state: ModuleState) -> ModuleRecord {
    ModuleRecord::new(id.into(), IdentityKey::new(id, "1.0.0")).with_state(state)
}

pub fn keyed(id: &str, name: &str, version: &str, state: ModuleState) -> ModuleRecord {
    ModuleRecord::new(id.into(), IdentityKey::new(name, version)).with_state(state)
}

pub fn lazy(record: ModuleRecord) -> ModuleRecord {
    record.with_policy(ActivationPolicy::Lazy)
}

pub fn ids(names: &[&str]) -> Vec<ModuleId> {
    names.iter().map(|n| ModuleId::new(n)).collect()
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub registry: Arc<ModuleRegistry>,
    pub runtime: Arc<RecordingRuntime>,
}

impl Harness {
    pub fn new(records: Vec<ModuleRecord>, requirements: Requirements) -> Self {
        Self::with(records, requirements, RecordingRuntime::new(), OrchestratorConfig::default())
    }

    pub fn with(
        records: Vec<ModuleRecord>,
        requirements: Requirements,
        runtime: RecordingRuntime,
        config: OrchestratorConfig,
    ) -> Self {
        let registry = Arc::new(ModuleRegistry::new());
        for r in records {
            registry.insert(r).unwrap();
        }
        let runtime = Arc::new(runtime);
        let (tx, rx): (EventSender, EventReceiver) = channel();
        runtime.confirm_refreshes(tx.clone());
        let orchestrator = Orchestrator::new(
            registry.clone(),
            Arc::new(requirements),
            runtime.clone(),
            (tx, rx),
        )
        .with_config(config);
        Self {
            orchestrator,
            registry,
            runtime,
        }
    }

    pub fn state(&self, id: &str) -> ModuleState {
        self.registry.state_of(&id.into()).unwrap()
    }

    pub fn record(&self, id: &str) -> ModuleRecord {
        self.registry.get(&id.into()).unwrap()
    }
}
