//! Transition State Machine
//!
//! The only writer of lifecycle fields in the registry. Commanded transitions
//! go `begin` -> runtime -> `complete`; observed ones go through `reconcile`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::contracts::{FailureKind, RuntimeFailure, RuntimeOutcome};
use crate::duplicates::DuplicateGroup;
use crate::error::IncompleteOutcome;
use crate::lifecycle::{ModuleState, Step, TransitionKind};
use crate::model::{
    ActivationPolicy, IdentityKey, InFlight, ModuleId, ModuleRecord, TransitionErrorKind,
};
use crate::registry::{ModuleRegistry, RegistryError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot {attempted} module '{module}' while it is {from_state}")]
    Conflict {
        module: ModuleId,
        from_state: ModuleState,
        attempted: TransitionKind,
    },
    #[error("unknown module '{0}'")]
    UnknownModule(ModuleId),
    #[error("permission denied for module '{module}': {message}")]
    PermissionDenied { module: ModuleId, message: String },
    #[error("{attempted} of module '{module}' failed: {message}")]
    Failed {
        module: ModuleId,
        attempted: TransitionKind,
        message: String,
    },
    #[error("{attempted} of module '{module}' is incomplete ({outcome})")]
    Incomplete {
        module: ModuleId,
        attempted: TransitionKind,
        deadline: Option<Duration>,
        outcome: IncompleteOutcome,
    },
    #[error("module '{module}' is a duplicate of identity {key}")]
    DuplicateIdentity { module: ModuleId, key: IdentityKey },
}

impl From<RegistryError> for TransitionError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownModule(id) | RegistryError::AlreadyRegistered(id) => {
                Self::UnknownModule(id)
            }
        }
    }
}

/// Proof that a transition has begun. Must be handed back to
/// [`TransitionMachine::complete`], [`TransitionMachine::mark_incomplete`] or
/// [`TransitionMachine::abandon`].
#[derive(Debug)]
#[must_use]
pub struct TransitionTicket {
    module: ModuleId,
    kind: TransitionKind,
    step: Step,
    previous: ModuleRecord,
}

impl TransitionTicket {
    pub fn module(&self) -> &ModuleId {
        &self.module
    }

    pub fn kind(&self) -> TransitionKind {
        self.kind
    }

    pub fn step(&self) -> Step {
        self.step
    }
}

/// An observed state that disagreed with the record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateMismatch {
    pub module: ModuleId,
    pub expected: ModuleState,
    pub observed: ModuleState,
}

impl fmt::Display for StateMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "module '{}' recorded as {} but observed {}",
            self.module, self.expected, self.observed
        )
    }
}

/// What `reconcile` did with an observed state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reconciliation {
    InSync,
    /// The event confirmed the transition in flight.
    Confirmed { kind: TransitionKind },
    /// The record was overwritten; `tag` is `External` or `LazyLoad`.
    Corrected {
        tag: TransitionKind,
        mismatch: StateMismatch,
    },
}

#[derive(Clone, Debug)]
pub struct TransitionMachine {
    registry: Arc<ModuleRegistry>,
}

impl TransitionMachine {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// Validate `kind` against the current state without writing anything.
    pub fn check(&self, module: &ModuleId, kind: TransitionKind) -> Result<Step, TransitionError> {
        let record = self
            .registry
            .get(module)
            .ok_or_else(|| TransitionError::UnknownModule(module.clone()))?;
        validate(&record, kind)
    }

    /// Validate and record the start of a commanded transition.
    pub fn begin(
        &self,
        module: &ModuleId,
        kind: TransitionKind,
    ) -> Result<TransitionTicket, TransitionError> {
        self.registry.with_record_mut(module, |r| {
            let step = match validate(r, kind) {
                Ok(step) => step,
                Err(err) => {
                    if r.transition.in_flight.is_none() {
                        r.transition.error = Some(TransitionErrorKind::StateConflict);
                    }
                    return Err(err);
                }
            };
            let previous = r.clone();
            r.transition.current = Some(kind);
            r.transition.error = None;
            r.transition.in_flight = Some(InFlight {
                kind,
                from: step.from,
                target: step.target,
            });
            r.state_unknown = false;
            if let Some(during) = step.during {
                r.state = during;
            }
            tracing::debug!(module = %module, kind = %kind, from = %step.from, "transition begun");
            Ok(TransitionTicket {
                module: module.clone(),
                kind,
                step,
                previous,
            })
        })?
    }

    /// Record the runtime's verdict on a begun transition and return the new state.
    pub fn complete(
        &self,
        ticket: TransitionTicket,
        result: Result<RuntimeOutcome, RuntimeFailure>,
    ) -> Result<ModuleState, TransitionError> {
        let TransitionTicket {
            module, kind, step, ..
        } = ticket;
        self.registry
            .with_record_mut(&module, |r| finish(r, kind, step, result))?
    }

    /// Apply a transition the runtime has already confirmed (refresh).
    pub fn apply_confirmed(
        &self,
        module: &ModuleId,
        kind: TransitionKind,
        result: Result<RuntimeOutcome, RuntimeFailure>,
    ) -> Result<ModuleState, TransitionError> {
        self.registry.with_record_mut(module, |r| {
            let step = validate(r, kind)?;
            r.transition.current = Some(kind);
            finish(r, kind, step, result)
        })?
    }

    /// The deadline fired before the runtime answered. The state stays where
    /// it was and is unknown until the next observed event.
    pub fn mark_incomplete(&self, ticket: TransitionTicket, deadline: Duration) -> TransitionError {
        let TransitionTicket { module, kind, .. } = ticket;
        let updated = self.registry.with_record_mut(&module, |r| {
            r.transition.error = Some(TransitionErrorKind::Incomplete);
            r.state_unknown = true;
            r.state
        });
        if let Ok(state) = updated {
            tracing::warn!(module = %module, kind = %kind, state = %state, ?deadline, "transition deadline elapsed");
        }
        TransitionError::Incomplete {
            module,
            attempted: kind,
            deadline: Some(deadline),
            outcome: IncompleteOutcome::StillRunning,
        }
    }

    /// Undo `begin` before anything reached the runtime.
    pub fn abandon(&self, ticket: TransitionTicket) {
        let TransitionTicket {
            module, previous, ..
        } = ticket;
        let restored = self.registry.with_record_mut(&module, |r| {
            r.state = previous.state;
            r.state_unknown = previous.state_unknown;
            r.transition = previous.transition;
        });
        if let Err(err) = restored {
            tracing::debug!(module = %module, error = %err, "nothing to abandon");
        }
    }

    /// Record that `module` lost a duplicate-identity contest in `group`.
    pub fn record_duplicate(&self, module: &ModuleId, group: &DuplicateGroup) -> TransitionError {
        let recorded = self.registry.with_record_mut(module, |r| {
            r.transition.current = Some(TransitionKind::Resolve);
            r.transition.error = Some(TransitionErrorKind::DuplicateIdentity);
        });
        if let Err(err) = recorded {
            tracing::debug!(module = %module, error = %err, "duplicate not recorded");
        }
        tracing::warn!(module = %module, key = %group.key, incumbent = ?group.incumbent, "excluded as duplicate");
        TransitionError::DuplicateIdentity {
            module: module.clone(),
            key: group.key.clone(),
        }
    }

    /// Bring the record in line with a state observed from the runtime.
    /// The runtime's view always wins.
    pub fn reconcile(
        &self,
        module: &ModuleId,
        observed: ModuleState,
    ) -> Result<Reconciliation, TransitionError> {
        let outcome = self.registry.with_record_mut(module, |r| {
            let was_unknown = std::mem::take(&mut r.state_unknown);

            if let Some(in_flight) = r.transition.in_flight {
                if observed == in_flight.target {
                    r.state = observed;
                    r.transition.in_flight = None;
                    if r.transition.error == Some(TransitionErrorKind::Incomplete) {
                        r.transition.error = None;
                    }
                    r.transition.pending.remove(&in_flight.kind);
                    return Reconciliation::Confirmed {
                        kind: in_flight.kind,
                    };
                }
                if was_unknown {
                    r.transition.in_flight = None;
                }
            }

            let expected = r.state;
            if expected == observed {
                return Reconciliation::InSync;
            }

            let lazy_load = r.activation_policy == ActivationPolicy::Lazy
                && observed == ModuleState::Active
                && matches!(
                    expected,
                    ModuleState::LazyPending | ModuleState::Resolved | ModuleState::Starting
                );
            let tag = if lazy_load {
                TransitionKind::LazyLoad
            } else {
                TransitionKind::External
            };
            r.state = observed;
            r.transition.current = Some(tag);
            Reconciliation::Corrected {
                tag,
                mismatch: StateMismatch {
                    module: module.clone(),
                    expected,
                    observed,
                },
            }
        })?;

        match &outcome {
            Reconciliation::Corrected { tag, mismatch } if *tag == TransitionKind::External => {
                tracing::warn!(%mismatch, "external transition observed, record corrected");
            }
            Reconciliation::Corrected { mismatch, .. } => {
                tracing::info!(module = %mismatch.module, "lazily activated on first use");
            }
            Reconciliation::Confirmed { kind } => {
                tracing::debug!(module = %module, kind = %kind, "transition confirmed by runtime");
            }
            Reconciliation::InSync => {}
        }
        Ok(outcome)
    }

    pub fn add_pending(&self, module: &ModuleId, kind: TransitionKind) -> Result<(), TransitionError> {
        Ok(self.registry.add_pending(module, kind)?)
    }

    /// Remove `kind` from the pending set; `true` if it was there.
    pub fn take_pending(&self, module: &ModuleId, kind: TransitionKind) -> Result<bool, TransitionError> {
        Ok(self
            .registry
            .with_record_mut(module, |r| r.transition.pending.remove(&kind))?)
    }
}

fn validate(record: &ModuleRecord, kind: TransitionKind) -> Result<Step, TransitionError> {
    let conflict = || TransitionError::Conflict {
        module: record.id.clone(),
        from_state: record.state,
        attempted: kind,
    };
    if record.transition.in_flight.is_some() && !record.state_unknown {
        return Err(conflict());
    }
    kind.step(record.state, record.activation_policy)
        .ok_or_else(conflict)
}

fn finish(
    r: &mut ModuleRecord,
    kind: TransitionKind,
    step: Step,
    result: Result<RuntimeOutcome, RuntimeFailure>,
) -> Result<ModuleState, TransitionError> {
    r.transition.in_flight = None;
    r.state_unknown = false;

    match result {
        Ok(outcome) => {
            r.state = outcome.reported.unwrap_or(step.target);
            r.transition.error = None;
            r.transition.pending.remove(&kind);
            match kind {
                TransitionKind::Activate => r.activated = true,
                TransitionKind::Deactivate => r.activated = false,
                _ => {}
            }
            if let Some(key) = outcome.identity_key {
                r.identity_key = key;
            }
            tracing::debug!(module = %r.id, kind = %kind, state = %r.state, "transition completed");
            Ok(r.state)
        }
        Err(failure) => {
            r.state = failure.reached.unwrap_or(step.from);
            let module = r.id.clone();
            let (error_kind, err) = match failure.kind {
                FailureKind::Permission => (
                    TransitionErrorKind::Permission,
                    TransitionError::PermissionDenied {
                        module,
                        message: failure.message,
                    },
                ),
                FailureKind::Conflict => (
                    TransitionErrorKind::StateConflict,
                    TransitionError::Conflict {
                        module,
                        from_state: step.from,
                        attempted: kind,
                    },
                ),
                FailureKind::Incomplete => (
                    TransitionErrorKind::Incomplete,
                    TransitionError::Incomplete {
                        module,
                        attempted: kind,
                        deadline: None,
                        outcome: IncompleteOutcome::DefinitelyFailed,
                    },
                ),
                FailureKind::Other => (
                    TransitionErrorKind::Failed,
                    TransitionError::Failed {
                        module,
                        attempted: kind,
                        message: failure.message,
                    },
                ),
            };
            r.transition.error = Some(error_kind);
            tracing::warn!(module = %r.id, kind = %kind, state = %r.state, error = %error_kind, "transition failed");
            Err(err)
        }
    }
}
