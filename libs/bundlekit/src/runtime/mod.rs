//! Async surface: the orchestrator and the channel runtime events arrive on.

pub mod events;
pub mod orchestrator;

pub use events::{channel, EventReceiver, EventSender, RefreshResult, RuntimeEvent};
pub use orchestrator::{CompletedTransition, OperationReport, Orchestrator, OrchestratorConfig};
