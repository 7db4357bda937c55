//! Seams to the collaborators the orchestrator depends on.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::duplicates::ResolutionHook;
use crate::lifecycle::{ModuleState, TransitionKind};
use crate::model::{Capability, IdentityKey, ModuleId};

/// Requirement metadata per module, supplied by a project/manifest reader.
///
/// Malformed or missing metadata is reported as an empty list; the graph
/// builder never fails on it.
pub trait RequirementSource: Send + Sync {
    /// Capabilities the module requires.
    fn requirements(&self, module: &ModuleId) -> Vec<Capability>;

    /// Capabilities the module provides.
    fn capabilities(&self, module: &ModuleId) -> Vec<Capability>;

    /// The identity key the module will carry after its next install/update.
    /// `None` when it is unknown or unchanged.
    fn workspace_key(&self, _module: &ModuleId) -> Option<IdentityKey> {
        None
    }
}

/// Build-error flags per module, supplied by a build subsystem.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildState {
    pub has_errors: bool,
    pub missing_build_state: bool,
}

impl BuildState {
    pub fn is_clean(&self) -> bool {
        !self.has_errors && !self.missing_build_state
    }
}

pub trait BuildStateSource: Send + Sync {
    fn build_state(&self, module: &ModuleId) -> BuildState;
}

/// Reports every module as cleanly built.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoBuildState;

impl BuildStateSource for NoBuildState {
    fn build_state(&self, _module: &ModuleId) -> BuildState {
        BuildState::default()
    }
}

/// What the runtime reports after executing a transition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeOutcome {
    /// The state the runtime actually reached, when it differs from the table's target.
    pub reported: Option<ModuleState>,
    /// The identity key the module carries now (after install/update).
    pub identity_key: Option<IdentityKey>,
}

impl RuntimeOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn with_reported(mut self, state: ModuleState) -> Self {
        self.reported = Some(state);
        self
    }

    pub fn with_identity_key(mut self, key: IdentityKey) -> Self {
        self.identity_key = Some(key);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    Permission,
    Conflict,
    /// The runtime gave up before finishing (its own timeout).
    Incomplete,
    Other,
}

/// A failed runtime operation and how far it got.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeFailure {
    pub kind: FailureKind,
    pub message: String,
    /// State the runtime had already advanced the module to before failing.
    pub reached: Option<ModuleState>,
}

impl RuntimeFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            reached: None,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Other, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permission, message)
    }

    pub fn reached(mut self, state: ModuleState) -> Self {
        self.reached = Some(state);
        self
    }
}

impl fmt::Display for RuntimeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RuntimeFailure {}

impl From<anyhow::Error> for RuntimeFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::other(format!("{err:#}"))
    }
}

/// The underlying module runtime driven by the orchestrator.
#[async_trait]
pub trait ModuleRuntime: Send + Sync {
    /// Execute one lifecycle operation on one module.
    async fn execute(
        &self,
        module: &ModuleId,
        kind: TransitionKind,
    ) -> Result<RuntimeOutcome, RuntimeFailure>;

    /// Resolve a set of modules together. The hook removes candidates that
    /// must not take part in this pass before anything is executed.
    async fn resolve(
        &self,
        candidates: &[ModuleId],
        hook: &dyn ResolutionHook,
    ) -> Vec<(ModuleId, Result<RuntimeOutcome, RuntimeFailure>)> {
        let mut admitted = candidates.to_vec();
        hook.filter_candidates(&mut admitted);

        let mut results = Vec::with_capacity(admitted.len());
        for module in admitted {
            let result = self.execute(&module, TransitionKind::Resolve).await;
            results.push((module, result));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_errors_become_other_failures() {
        let err = anyhow::anyhow!("disk full").context("writing bundle");
        let failure = RuntimeFailure::from(err);
        assert_eq!(failure.kind, FailureKind::Other);
        assert!(failure.message.contains("writing bundle"));
        assert!(failure.message.contains("disk full"));
        assert_eq!(failure.reached, None);
    }

    #[test]
    fn build_state_cleanliness() {
        assert!(NoBuildState.build_state(&"x".into()).is_clean());
        let broken = BuildState {
            has_errors: true,
            missing_build_state: false,
        };
        assert!(!broken.is_clean());
    }
}
