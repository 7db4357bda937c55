use std::collections::HashSet;

use async_trait::async_trait;
use bundlekit::{
    EventSender, ModuleId, ModuleRuntime, RuntimeFailure, RuntimeOutcome, TransitionKind,
};

/// In-process stand-in for a module runtime: every transition succeeds,
/// except on modules told to fail, and refreshes are confirmed at once.
pub struct SimulatedRuntime {
    events: EventSender,
    failing: HashSet<ModuleId>,
}

impl SimulatedRuntime {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            failing: HashSet::new(),
        }
    }

    pub fn with_failing(mut self, modules: impl IntoIterator<Item = ModuleId>) -> Self {
        self.failing.extend(modules);
        self
    }
}

#[async_trait]
impl ModuleRuntime for SimulatedRuntime {
    async fn execute(
        &self,
        module: &ModuleId,
        kind: TransitionKind,
    ) -> Result<RuntimeOutcome, RuntimeFailure> {
        if self.failing.contains(module) {
            tracing::info!(module = %module, kind = %kind, "simulated failure");
            return Err(RuntimeFailure::other(format!("simulated {kind} failure")));
        }
        tracing::info!(module = %module, kind = %kind, "simulated");
        if kind == TransitionKind::Refresh {
            self.events
                .refresh_completed(module.clone(), Ok(RuntimeOutcome::done()));
        }
        Ok(RuntimeOutcome::done())
    }
}
