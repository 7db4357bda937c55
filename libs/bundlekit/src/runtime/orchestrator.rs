//! Orchestrator - drives closures and transitions against a module runtime
//!
//! Every command and closure computation runs on one lane (an async mutex),
//! so traversal never sees a half-applied operation. Runtime events arrive on
//! a separate channel and are applied under the registry lock; the lane syncs
//! with that channel before it reads a module's state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::closure::{Closure, ClosureSorter, Direction};
use crate::contracts::{
    BuildStateSource, ModuleRuntime, NoBuildState, RequirementSource, RuntimeFailure,
    RuntimeOutcome,
};
use crate::duplicates::{DuplicateCandidate, DuplicateGroups, DuplicateResolver, ResolutionPass};
use crate::error::OrchestratorError;
use crate::graph::DependencyGraph;
use crate::lifecycle::{ModuleState, TransitionKind};
use crate::model::ModuleId;
use crate::policy::{DependencyOptions, OperationKind, PolicyEngine, Scope, WorkingSet};
use crate::registry::ModuleRegistry;
use crate::runtime::events::{spawn_event_pump, EventPump, EventReceiver, EventSender};
use crate::transition::{Reconciliation, TransitionMachine};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub options: DependencyOptions,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(30),
            options: DependencyOptions::default(),
        }
    }
}

/// One transition `run_operation` carried out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedTransition {
    pub module: ModuleId,
    pub kind: TransitionKind,
    pub state: ModuleState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationReport {
    pub working_set: WorkingSet,
    pub completed: Vec<CompletedTransition>,
}

type ModuleResults = Vec<(ModuleId, Result<ModuleState, OrchestratorError>)>;

pub struct Orchestrator {
    registry: Arc<ModuleRegistry>,
    requirements: Arc<dyn RequirementSource>,
    build_state: Arc<dyn BuildStateSource>,
    runtime: Arc<dyn ModuleRuntime>,
    config: OrchestratorConfig,
    machine: TransitionMachine,
    events: EventSender,
    queued: Mutex<Option<EventReceiver>>,
    pump: EventPump,
    pump_task: Mutex<Option<JoinHandle<()>>>,
    lane: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("pump_started", &self.queued.lock().is_none())
            .finish()
    }
}

impl Orchestrator {
    /// `events` is the channel whose sending half the runtime adapter reports on.
    pub fn new(
        registry: Arc<ModuleRegistry>,
        requirements: Arc<dyn RequirementSource>,
        runtime: Arc<dyn ModuleRuntime>,
        events: (EventSender, EventReceiver),
    ) -> Self {
        let (sender, receiver) = events;
        let machine = TransitionMachine::new(Arc::clone(&registry));
        Self {
            pump: EventPump::new(machine.clone()),
            registry,
            requirements,
            build_state: Arc::new(NoBuildState),
            runtime,
            config: OrchestratorConfig::default(),
            machine,
            events: sender,
            queued: Mutex::new(Some(receiver)),
            pump_task: Mutex::new(None),
            lane: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_build_state(mut self, build_state: Arc<dyn BuildStateSource>) -> Self {
        self.build_state = build_state;
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn machine(&self) -> &TransitionMachine {
        &self.machine
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// A sender for runtime events, for adapters created after the orchestrator.
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    /// Start applying runtime events in the background. Idempotent; must be
    /// called inside a tokio runtime.
    pub fn start(&self) {
        let Some(receiver) = self.queued.lock().take() else {
            return;
        };
        tracing::info!("Phase: event pump");
        let handle = spawn_event_pump(self.pump.clone(), receiver, self.shutdown.child_token());
        *self.pump_task.lock() = Some(handle);
    }

    /// Stop the event pump and wait for it to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.pump_task.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "event pump ended abnormally");
            }
        }
    }

    /// Wait until every runtime event sent so far has been applied.
    pub async fn sync(&self) {
        {
            let mut queued = self.queued.lock();
            if let Some(receiver) = queued.as_mut() {
                self.pump.drain(receiver);
                return;
            }
        }
        if let Some(done) = self.events.barrier() {
            if done.await.is_err() {
                tracing::debug!("event pump stopped before the barrier");
            }
        }
    }

    fn ensure_known(&self, modules: &[ModuleId]) -> Result<(), OrchestratorError> {
        match modules.iter().find(|m| !self.registry.contains(m)) {
            Some(unknown) => Err(OrchestratorError::UnknownModule(unknown.clone())),
            None => Ok(()),
        }
    }

    /// Ordered closure of `seed` over the modules in `scope`.
    pub async fn compute_closure(
        &self,
        seed: &[ModuleId],
        direction: Direction,
        scope: &Scope,
        allow_cycles: bool,
    ) -> Result<Closure, OrchestratorError> {
        self.ensure_known(seed)?;
        let _lane = self.lane.lock().await;
        self.sync().await;
        self.closure_locked(seed, direction, scope, allow_cycles)
    }

    fn closure_locked(
        &self,
        seed: &[ModuleId],
        direction: Direction,
        scope: &Scope,
        allow_cycles: bool,
    ) -> Result<Closure, OrchestratorError> {
        let snapshot = self.registry.snapshot();
        let candidates = scope.candidates(&snapshot, seed);
        let graph = DependencyGraph::build(&candidates, self.requirements.as_ref());
        let closure = ClosureSorter::new(&graph).sort(seed, direction, allow_cycles)?;
        tracing::debug!(?direction, closure = %closure, "closure computed");
        Ok(closure)
    }

    pub async fn plan_operation(
        &self,
        seed: &[ModuleId],
        operation: OperationKind,
    ) -> Result<WorkingSet, OrchestratorError> {
        self.plan_operation_with(seed, operation, &self.config.options)
            .await
    }

    pub async fn plan_operation_with(
        &self,
        seed: &[ModuleId],
        operation: OperationKind,
        options: &DependencyOptions,
    ) -> Result<WorkingSet, OrchestratorError> {
        self.ensure_known(seed)?;
        let _lane = self.lane.lock().await;
        self.sync().await;
        self.plan_locked(seed, operation, options)
    }

    fn plan_locked(
        &self,
        seed: &[ModuleId],
        operation: OperationKind,
        options: &DependencyOptions,
    ) -> Result<WorkingSet, OrchestratorError> {
        let snapshot = self.registry.snapshot();
        let engine = PolicyEngine::new(
            &snapshot,
            self.requirements.as_ref(),
            self.build_state.as_ref(),
        );
        Ok(engine.plan(seed, operation, options)?)
    }

    /// Command one transition on one module and return the state it ended in.
    pub async fn command_transition(
        &self,
        module: &ModuleId,
        kind: TransitionKind,
    ) -> Result<ModuleState, OrchestratorError> {
        let _lane = self.lane.lock().await;
        self.sync().await;
        self.command_locked(module, kind).await
    }

    async fn command_locked(
        &self,
        module: &ModuleId,
        kind: TransitionKind,
    ) -> Result<ModuleState, OrchestratorError> {
        match kind {
            TransitionKind::Resolve => {
                let mut results = self.resolve_locked(std::slice::from_ref(module)).await?;
                return match results.pop() {
                    Some((_, result)) => result,
                    None => Err(OrchestratorError::UnknownModule(module.clone())),
                };
            }
            TransitionKind::Refresh => {
                let mut states = self
                    .refresh_locked(std::slice::from_ref(module), CancellationToken::new())
                    .await?;
                return match states.pop() {
                    Some((_, state)) => Ok(state),
                    None => Err(OrchestratorError::UnknownModule(module.clone())),
                };
            }
            _ => {}
        }

        let ticket = self.machine.begin(module, kind)?;
        if kind.is_flag_only() {
            return Ok(self.machine.complete(ticket, Ok(RuntimeOutcome::done()))?);
        }

        tracing::debug!(module = %module, kind = %kind, "executing on runtime");
        let runtime = Arc::clone(&self.runtime);
        let target = module.clone();
        let task = tokio::spawn(async move { runtime.execute(&target, kind).await });

        let result = match self.deadline_for(kind) {
            Some(deadline) => match tokio::time::timeout(deadline, task).await {
                Ok(joined) => flatten(joined),
                // the spawned task keeps running detached
                Err(_) => return Err(self.machine.mark_incomplete(ticket, deadline).into()),
            },
            None => flatten(task.await),
        };
        Ok(self.machine.complete(ticket, result)?)
    }

    fn deadline_for(&self, kind: TransitionKind) -> Option<Duration> {
        match kind {
            TransitionKind::Start => Some(self.config.start_timeout),
            TransitionKind::Stop => Some(self.config.stop_timeout),
            _ => None,
        }
    }

    /// Resolve `modules` together in one pass, with duplicates filtered out.
    pub async fn resolve_modules(
        &self,
        modules: &[ModuleId],
    ) -> Result<ModuleResults, OrchestratorError> {
        self.ensure_known(modules)?;
        let _lane = self.lane.lock().await;
        self.sync().await;
        self.resolve_locked(modules).await
    }

    async fn resolve_locked(&self, modules: &[ModuleId]) -> Result<ModuleResults, OrchestratorError> {
        let groups = self.duplicate_groups(modules)?;
        let pass = ResolutionPass::begin(groups);

        let mut outcomes: HashMap<ModuleId, Result<ModuleState, OrchestratorError>> =
            HashMap::new();
        let mut tickets = HashMap::new();
        let mut admitted = Vec::new();

        for module in modules {
            if let Some(group) = pass.group_of(module) {
                self.machine.record_duplicate(module, group);
                outcomes.insert(
                    module.clone(),
                    Err(OrchestratorError::DuplicateIdentity {
                        group: group.clone(),
                    }),
                );
                continue;
            }
            match self.machine.begin(module, TransitionKind::Resolve) {
                Ok(ticket) => {
                    tickets.insert(module.clone(), ticket);
                    admitted.push(module.clone());
                }
                Err(err) => {
                    outcomes.insert(module.clone(), Err(err.into()));
                }
            }
        }

        if !admitted.is_empty() {
            tracing::info!(modules = ?admitted, "resolution pass");
            for (module, result) in self.runtime.resolve(&admitted, &pass).await {
                if let Some(ticket) = tickets.remove(&module) {
                    let state = self.machine.complete(ticket, result).map_err(Into::into);
                    outcomes.insert(module, state);
                }
            }
        }
        // the runtime never got to these
        for (module, ticket) in tickets {
            tracing::debug!(module = %module, "resolution not reported by runtime");
            self.machine.abandon(ticket);
        }

        Ok(modules
            .iter()
            .filter_map(|m| outcomes.remove(m).map(|r| (m.clone(), r)))
            .collect())
    }

    fn duplicate_groups(&self, modules: &[ModuleId]) -> Result<DuplicateGroups, OrchestratorError> {
        let snapshot = self.registry.snapshot();
        let candidates =
            DuplicateCandidate::candidates(&snapshot, modules, self.requirements.as_ref());
        Ok(DuplicateResolver.resolve(&candidates, &snapshot)?)
    }

    /// Collision groups among `candidates`, without touching any record.
    pub async fn resolve_duplicates(
        &self,
        candidates: &[ModuleId],
    ) -> Result<DuplicateGroups, OrchestratorError> {
        let _lane = self.lane.lock().await;
        self.sync().await;
        self.duplicate_groups(candidates)
    }

    /// Apply one observed state change right away.
    pub fn reconcile_external_event(
        &self,
        module: &ModuleId,
        observed: ModuleState,
    ) -> Result<Reconciliation, OrchestratorError> {
        Ok(self.machine.reconcile(module, observed)?)
    }

    /// Completion notification for a refresh the runtime was asked to perform.
    pub fn notify_refresh_complete(
        &self,
        module: ModuleId,
        result: Result<RuntimeOutcome, RuntimeFailure>,
    ) -> bool {
        self.events.refresh_completed(module, result)
    }

    /// Refresh `modules` and wait for the runtime to confirm each one.
    ///
    /// Cancelling leaves every record as it was before the call.
    pub async fn refresh(
        &self,
        modules: &[ModuleId],
        cancel: CancellationToken,
    ) -> Result<Vec<(ModuleId, ModuleState)>, OrchestratorError> {
        self.ensure_known(modules)?;
        let _lane = self.lane.lock().await;
        self.sync().await;
        self.refresh_locked(modules, cancel).await
    }

    async fn refresh_locked(
        &self,
        modules: &[ModuleId],
        cancel: CancellationToken,
    ) -> Result<Vec<(ModuleId, ModuleState)>, OrchestratorError> {
        for module in modules {
            self.machine.check(module, TransitionKind::Refresh)?;
        }
        self.start();

        let waiting: Vec<_> = modules
            .iter()
            .map(|m| (m.clone(), self.pump.wait_for_refresh(m)))
            .collect();
        let forget = || modules.iter().for_each(|m| self.pump.forget_refresh(m));
        let cancelled = || {
            forget();
            tracing::info!(modules = ?modules, "refresh cancelled, records untouched");
            OrchestratorError::Cancelled
        };

        tracing::info!(modules = ?modules, "Phase: refresh");
        for module in modules {
            let executed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                executed = self.runtime.execute(module, TransitionKind::Refresh) => executed,
            };
            if let Err(failure) = executed {
                forget();
                let message = failure.message.clone();
                return Err(
                    match self
                        .machine
                        .apply_confirmed(module, TransitionKind::Refresh, Err(failure))
                    {
                        Err(err) => err.into(),
                        Ok(_) => OrchestratorError::RuntimeFailed {
                            module: module.clone(),
                            attempted: TransitionKind::Refresh,
                            message,
                        },
                    },
                );
            }
        }

        let confirmations = async {
            let mut results = Vec::with_capacity(waiting.len());
            for (module, rx) in waiting {
                let result = rx.await.unwrap_or_else(|_| {
                    Err(RuntimeFailure::other("refresh confirmation channel closed"))
                });
                results.push((module, result));
            }
            results
        };
        let confirmations = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            results = confirmations => results,
        };

        let mut states = Vec::with_capacity(confirmations.len());
        let mut first_error = None;
        for (module, result) in confirmations {
            match self
                .machine
                .apply_confirmed(&module, TransitionKind::Refresh, result)
            {
                Ok(state) => states.push((module, state)),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(states),
        }
    }

    /// Plan `operation` on `seed`, then run its transitions phase by phase
    /// across the working set. The first failure aborts the run.
    pub async fn run_operation(
        &self,
        seed: &[ModuleId],
        operation: OperationKind,
    ) -> Result<OperationReport, OrchestratorError> {
        self.ensure_known(seed)?;
        let _lane = self.lane.lock().await;
        self.sync().await;
        let working_set = self.plan_locked(seed, operation, &self.config.options)?;
        tracing::info!(
            operation = %operation,
            modules = ?working_set.ordered,
            "running operation"
        );

        let steps: HashMap<ModuleId, Vec<TransitionKind>> = working_set
            .ordered
            .iter()
            .filter_map(|m| {
                let state = self.registry.state_of(m)?;
                Some((m.clone(), operation.transitions_from(state)))
            })
            .collect();

        let mut completed = Vec::new();
        for &phase in operation.phases() {
            let order = if brings_up(phase) {
                working_set.dependencies_first()
            } else {
                working_set.dependents_first()
            };
            let modules: Vec<ModuleId> = order
                .into_iter()
                .filter(|m| steps.get(m).is_some_and(|s| s.contains(&phase)))
                .collect();
            if modules.is_empty() {
                continue;
            }
            tracing::info!("Phase: {phase}");

            match phase {
                TransitionKind::Resolve => {
                    for (module, result) in self.resolve_locked(&modules).await? {
                        let state = result?;
                        completed.push(CompletedTransition {
                            module,
                            kind: phase,
                            state,
                        });
                    }
                }
                TransitionKind::Refresh => {
                    let states = self
                        .refresh_locked(&modules, self.shutdown.child_token())
                        .await?;
                    completed.extend(states.into_iter().map(|(module, state)| {
                        CompletedTransition {
                            module,
                            kind: phase,
                            state,
                        }
                    }));
                }
                _ => {
                    for module in modules {
                        let state = self.command_locked(&module, phase).await?;
                        completed.push(CompletedTransition {
                            module,
                            kind: phase,
                            state,
                        });
                    }
                }
            }
        }

        Ok(OperationReport {
            working_set,
            completed,
        })
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn brings_up(kind: TransitionKind) -> bool {
    matches!(
        kind,
        TransitionKind::Activate
            | TransitionKind::Install
            | TransitionKind::Resolve
            | TransitionKind::Start
            | TransitionKind::Refresh
    )
}

fn flatten(
    joined: Result<Result<RuntimeOutcome, RuntimeFailure>, tokio::task::JoinError>,
) -> Result<RuntimeOutcome, RuntimeFailure> {
    joined.unwrap_or_else(|err| Err(RuntimeFailure::other(format!("runtime task failed: {err}"))))
}
