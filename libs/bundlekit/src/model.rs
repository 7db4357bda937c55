//! Identifiers and per-module records owned by the registry.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::lifecycle::{ModuleState, TransitionKind};

/// Stable handle of a module (a project or location reference).
///
/// This is what every component passes around; it never changes for the
/// lifetime of the module, unlike its [`IdentityKey`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(Arc<str>);

impl ModuleId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ModuleId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// Deployment identity of a module revision: symbolic name plus version.
///
/// An empty key means "not yet determinable" and never collides.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub name: String,
    pub version: String,
}

impl IdentityKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("<unknown>");
        }
        write!(f, "{}_{}", self.name, self.version)
    }
}

/// A capability reference: what a module requires or provides.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The capability every module implicitly provides under its symbolic name.
    pub fn module(name: &str) -> Self {
        Self(format!("bundle:{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a started module is brought up eagerly or on first use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationPolicy {
    #[default]
    Eager,
    Lazy,
}

/// Kind of failure recorded on a module's transition record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionErrorKind {
    StateConflict,
    Permission,
    DuplicateIdentity,
    Incomplete,
    Failed,
}

impl fmt::Display for TransitionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StateConflict => "state conflict",
            Self::Permission => "permission denied",
            Self::DuplicateIdentity => "duplicate identity",
            Self::Incomplete => "incomplete",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A commanded transition that has begun but not yet completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlight {
    pub kind: TransitionKind,
    pub from: ModuleState,
    pub target: ModuleState,
}

/// Per-module transition log. Only the transition machine mutates it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Last commanded (or observed, for `External`/`LazyLoad`) transition.
    pub current: Option<TransitionKind>,
    pub error: Option<TransitionErrorKind>,
    /// Transitions the job layer intends to run later.
    #[serde(default)]
    pub pending: BTreeSet<TransitionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<InFlight>,
}

/// Everything the registry knows about one module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub id: ModuleId,
    pub identity_key: IdentityKey,
    pub state: ModuleState,
    pub activated: bool,
    #[serde(default)]
    pub activation_policy: ActivationPolicy,
    #[serde(default)]
    pub transition: TransitionRecord,
    /// Set when a commanded start/stop timed out; cleared by the next observed event.
    #[serde(default)]
    pub state_unknown: bool,
}

impl ModuleRecord {
    pub fn new(id: ModuleId, identity_key: IdentityKey) -> Self {
        Self {
            id,
            identity_key,
            state: ModuleState::Uninstalled,
            activated: false,
            activation_policy: ActivationPolicy::Eager,
            transition: TransitionRecord::default(),
            state_unknown: false,
        }
    }

    pub fn with_state(mut self, state: ModuleState) -> Self {
        self.state = state;
        self
    }

    pub fn with_activated(mut self, activated: bool) -> Self {
        self.activated = activated;
        self
    }

    pub fn with_policy(mut self, policy: ActivationPolicy) -> Self {
        self.activation_policy = policy;
        self
    }

    pub fn is_in_error(&self) -> bool {
        self.transition.error.is_some()
    }
}
