//! # Bundlekit - Dependency Closure and Lifecycle Orchestration
//!
//! Coordinates lifecycle operations across a set of interdependent modules
//! ("bundles") that declare requirements on each other.
//!
//! ## Features
//!
//! - **Closures**: ordered transitive dependency sets, in either direction,
//!   with cycles reported or tolerated as blocks
//! - **Policies**: per-operation working sets that pull in dependencies or
//!   dependents and drop modules that cannot safely run
//! - **Lifecycle**: one state machine for commanded, lazily triggered and
//!   externally observed transitions
//! - **Duplicates**: identity collisions are detected before a resolution
//!   pass and losers are filtered out of it
//!
//! ## Example
//!
//! ```rust,ignore
//! use bundlekit::{runtime, ModuleRegistry, OperationKind, Orchestrator};
//!
//! let orchestrator = Orchestrator::new(registry, requirements, runtime, runtime::channel());
//! orchestrator.start();
//! let report = orchestrator
//!     .run_operation(&["app".into()], OperationKind::Activate)
//!     .await?;
//! ```

pub mod closure;
pub mod contracts;
pub mod duplicates;
pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod model;
pub mod policy;
pub mod registry;
pub mod runtime;
pub mod transition;

pub use async_trait::async_trait;

pub use closure::{compute_closure, Closure, ClosureSorter, CycleError, Direction};
pub use contracts::{
    BuildState, BuildStateSource, FailureKind, ModuleRuntime, NoBuildState, RequirementSource,
    RuntimeFailure, RuntimeOutcome,
};
pub use duplicates::{
    DuplicateCandidate, DuplicateError, DuplicateGroup, DuplicateGroups, DuplicateResolver,
    ResolutionHook, ResolutionPass,
};
pub use error::{IncompleteOutcome, OrchestratorError};
pub use graph::DependencyGraph;
pub use lifecycle::{ModuleState, Step, TransitionKind};
pub use model::{
    ActivationPolicy, Capability, IdentityKey, InFlight, ModuleId, ModuleRecord,
    TransitionErrorKind, TransitionRecord,
};
pub use policy::{
    DependencyOptions, Exclusion, ExclusionReason, OperationKind, PolicyEngine, Scope, WorkingSet,
};
pub use registry::{ModuleRegistry, RegistryError, RegistrySnapshot};
pub use runtime::{
    CompletedTransition, EventReceiver, EventSender, OperationReport, Orchestrator,
    OrchestratorConfig,
};
pub use transition::{
    Reconciliation, StateMismatch, TransitionError, TransitionMachine, TransitionTicket,
};
