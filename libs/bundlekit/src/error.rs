//! Errors surfaced by the orchestrator.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::closure::CycleError;
use crate::duplicates::{DuplicateError, DuplicateGroup};
use crate::lifecycle::{ModuleState, TransitionKind};
use crate::model::ModuleId;
use crate::registry::RegistryError;
use crate::transition::{StateMismatch, TransitionError};

/// Whether an incomplete transition may still be running in the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteOutcome {
    /// The runtime gave up; nothing is still running.
    DefinitelyFailed,
    /// The deadline fired first; the runtime may still finish it.
    StillRunning,
}

impl fmt::Display for IncompleteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DefinitelyFailed => f.write_str("definitely failed"),
            Self::StillRunning => f.write_str("unknown, possibly still running"),
        }
    }
}

fn join(ids: &[ModuleId]) -> String {
    ids.iter()
        .map(ModuleId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_group(group: &DuplicateGroup) -> String {
    let kept = group
        .incumbent
        .as_ref()
        .map(ModuleId::as_str)
        .unwrap_or("-");
    format!("{}: kept {kept}, excluded {}", group.key, join(&group.excluded))
}

fn deadline_suffix(deadline: &Option<Duration>) -> String {
    deadline
        .map(|d| format!(" after {}ms", d.as_millis()))
        .unwrap_or_default()
}

/// Everything the orchestrator surface can fail with.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("dependency cycle detected among modules: {}", join(.members))]
    CycleDetected { members: Vec<ModuleId> },

    #[error("cannot {attempted} module '{module}' while it is {from_state}")]
    TransitionConflict {
        module: ModuleId,
        from_state: ModuleState,
        attempted: TransitionKind,
    },

    #[error("duplicate identity {}", describe_group(.group))]
    DuplicateIdentity { group: DuplicateGroup },

    #[error("circular identity swap between '{a}' and '{b}'")]
    CircularIdentitySwap { a: ModuleId, b: ModuleId },

    #[error("{attempted} of module '{module}' is incomplete{}: {outcome}", deadline_suffix(.deadline))]
    Incomplete {
        module: ModuleId,
        attempted: TransitionKind,
        deadline: Option<Duration>,
        outcome: IncompleteOutcome,
    },

    #[error("permission denied for module '{module}': {message}")]
    PermissionDenied { module: ModuleId, message: String },

    #[error("module '{module}' recorded as {expected} but observed {observed}")]
    ExternalStateMismatch {
        module: ModuleId,
        expected: ModuleState,
        observed: ModuleState,
    },

    #[error("unknown module '{0}'")]
    UnknownModule(ModuleId),

    #[error("{attempted} of module '{module}' failed: {message}")]
    RuntimeFailed {
        module: ModuleId,
        attempted: TransitionKind,
        message: String,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl OrchestratorError {
    /// The modules this error is about, for reporting.
    pub fn modules(&self) -> Vec<ModuleId> {
        match self {
            Self::CycleDetected { members } => members.clone(),
            Self::DuplicateIdentity { group } => group.members.clone(),
            Self::CircularIdentitySwap { a, b } => vec![a.clone(), b.clone()],
            Self::TransitionConflict { module, .. }
            | Self::Incomplete { module, .. }
            | Self::PermissionDenied { module, .. }
            | Self::ExternalStateMismatch { module, .. }
            | Self::RuntimeFailed { module, .. }
            | Self::UnknownModule(module) => vec![module.clone()],
            Self::Cancelled => Vec::new(),
        }
    }
}

impl From<CycleError> for OrchestratorError {
    fn from(err: CycleError) -> Self {
        Self::CycleDetected {
            members: err.members,
        }
    }
}

impl From<DuplicateError> for OrchestratorError {
    fn from(err: DuplicateError) -> Self {
        match err {
            DuplicateError::CircularIdentitySwap { a, b } => Self::CircularIdentitySwap { a, b },
        }
    }
}

impl From<RegistryError> for OrchestratorError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownModule(id) | RegistryError::AlreadyRegistered(id) => {
                Self::UnknownModule(id)
            }
        }
    }
}

impl From<StateMismatch> for OrchestratorError {
    fn from(m: StateMismatch) -> Self {
        Self::ExternalStateMismatch {
            module: m.module,
            expected: m.expected,
            observed: m.observed,
        }
    }
}

impl From<TransitionError> for OrchestratorError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::Conflict {
                module,
                from_state,
                attempted,
            } => Self::TransitionConflict {
                module,
                from_state,
                attempted,
            },
            TransitionError::UnknownModule(id) => Self::UnknownModule(id),
            TransitionError::PermissionDenied { module, message } => {
                Self::PermissionDenied { module, message }
            }
            TransitionError::Failed {
                module,
                attempted,
                message,
            } => Self::RuntimeFailed {
                module,
                attempted,
                message,
            },
            TransitionError::Incomplete {
                module,
                attempted,
                deadline,
                outcome,
            } => Self::Incomplete {
                module,
                attempted,
                deadline,
                outcome,
            },
            TransitionError::DuplicateIdentity { module, key } => Self::DuplicateIdentity {
                group: DuplicateGroup {
                    key,
                    incumbent: None,
                    members: vec![module.clone()],
                    excluded: vec![module],
                },
            },
        }
    }
}
