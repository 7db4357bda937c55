//! Lifecycle states and the transition table.
//!
//! The table is a single exhaustive `match` so that adding a state or a
//! transition kind is a compile error until every combination is decided.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::ActivationPolicy;

/// Deployment state of a module as recorded by the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Uninstalled,
    Installed,
    Resolved,
    Starting,
    LazyPending,
    Active,
    Stopping,
}

impl ModuleState {
    /// Resolved or any state past it.
    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            Self::Resolved | Self::Starting | Self::LazyPending | Self::Active | Self::Stopping
        )
    }

    /// Running from the orchestrator's point of view (must be stopped before tearing down).
    pub fn is_running(self) -> bool {
        matches!(self, Self::Active | Self::LazyPending)
    }

    pub fn is_installed(self) -> bool {
        self != Self::Uninstalled
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninstalled => "uninstalled",
            Self::Installed => "installed",
            Self::Resolved => "resolved",
            Self::Starting => "starting",
            Self::LazyPending => "lazy_pending",
            Self::Active => "active",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// A commanded or observed lifecycle operation on one module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Install,
    Resolve,
    Start,
    Stop,
    Update,
    Refresh,
    Uninstall,
    Activate,
    Deactivate,
    /// Observed state change that the orchestrator did not command.
    External,
    /// A lazily activated module came up on first use.
    LazyLoad,
}

/// One row of the transition table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Step {
    pub from: ModuleState,
    /// State recorded while the runtime executes, if any.
    pub during: Option<ModuleState>,
    pub target: ModuleState,
}

impl TransitionKind {
    /// Synthetic kinds only tag observed events; they are never commanded.
    pub fn is_synthetic(self) -> bool {
        matches!(self, Self::External | Self::LazyLoad)
    }

    /// Kinds that only flip the activation flag and never reach the runtime.
    pub fn is_flag_only(self) -> bool {
        matches!(self, Self::Activate | Self::Deactivate)
    }

    /// Kinds that are bounded by a deadline when executed.
    pub fn is_timed(self) -> bool {
        matches!(self, Self::Start | Self::Stop)
    }

    /// Looks up the transition table. `None` means the kind cannot be
    /// commanded from `from`.
    pub fn step(self, from: ModuleState, policy: ActivationPolicy) -> Option<Step> {
        use ModuleState as S;

        let row = |during, target| {
            Some(Step {
                from,
                during,
                target,
            })
        };

        match self {
            Self::Install => match from {
                S::Uninstalled => row(None, S::Installed),
                _ => None,
            },
            Self::Resolve => match from {
                S::Installed => row(None, S::Resolved),
                _ => None,
            },
            Self::Start => match (from, policy) {
                (S::Resolved, ActivationPolicy::Eager) => row(Some(S::Starting), S::Active),
                (S::Resolved, ActivationPolicy::Lazy) => row(Some(S::Starting), S::LazyPending),
                (S::LazyPending, _) => row(Some(S::Starting), S::Active),
                _ => None,
            },
            Self::Stop => match from {
                S::Active | S::LazyPending => row(Some(S::Stopping), S::Resolved),
                _ => None,
            },
            Self::Update => match from {
                S::Installed | S::Resolved | S::Active | S::LazyPending => row(None, S::Installed),
                _ => None,
            },
            Self::Refresh => match from {
                S::Installed => row(None, S::Resolved),
                S::Resolved | S::Active | S::LazyPending => row(None, from),
                _ => None,
            },
            Self::Uninstall => match from {
                S::Uninstalled => None,
                _ => row(None, S::Uninstalled),
            },
            Self::Activate | Self::Deactivate => row(None, from),
            Self::External | Self::LazyLoad => None,
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Install => "install",
            Self::Resolve => "resolve",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Update => "update",
            Self::Refresh => "refresh",
            Self::Uninstall => "uninstall",
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::External => "external",
            Self::LazyLoad => "lazy_load",
        };
        f.write_str(s)
    }
}
