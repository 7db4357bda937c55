//! Notification channel for runtime-originated events.
//!
//! The runtime adapter holds an [`EventSender`] and reports state changes it
//! observed. A pump task applies them to the registry in arrival order; a
//! barrier lets the coordinator wait until everything sent before it has
//! been applied.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::contracts::{RuntimeFailure, RuntimeOutcome};
use crate::lifecycle::ModuleState;
use crate::model::ModuleId;
use crate::transition::TransitionMachine;

pub type RefreshResult = Result<RuntimeOutcome, RuntimeFailure>;

#[derive(Debug)]
pub enum RuntimeEvent {
    /// The runtime reports `module` is now in `observed`.
    StateChanged {
        module: ModuleId,
        observed: ModuleState,
    },
    /// Asynchronous confirmation of a refresh.
    RefreshCompleted {
        module: ModuleId,
        result: RefreshResult,
    },
    /// Answered once every earlier event has been applied.
    Barrier(oneshot::Sender<()>),
}

/// Sending half, cheap to clone. Handed to the runtime adapter.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<RuntimeEvent>,
}

impl EventSender {
    /// Returns `false` once the orchestrator is gone.
    pub fn state_changed(&self, module: ModuleId, observed: ModuleState) -> bool {
        self.tx
            .send(RuntimeEvent::StateChanged { module, observed })
            .is_ok()
    }

    pub fn refresh_completed(&self, module: ModuleId, result: RefreshResult) -> bool {
        self.tx
            .send(RuntimeEvent::RefreshCompleted { module, result })
            .is_ok()
    }

    pub(crate) fn barrier(&self) -> Option<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(RuntimeEvent::Barrier(tx)).ok()?;
        Some(rx)
    }
}

#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<RuntimeEvent>,
}

pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventReceiver { rx })
}

/// Applies events to the registry and hands refresh confirmations to whoever
/// is waiting for them.
#[derive(Clone)]
pub(crate) struct EventPump {
    machine: TransitionMachine,
    waiters: Arc<DashMap<ModuleId, oneshot::Sender<RefreshResult>>>,
}

impl EventPump {
    pub(crate) fn new(machine: TransitionMachine) -> Self {
        Self {
            machine,
            waiters: Arc::new(DashMap::new()),
        }
    }

    pub(crate) fn wait_for_refresh(&self, module: &ModuleId) -> oneshot::Receiver<RefreshResult> {
        let (tx, rx) = oneshot::channel();
        if self.waiters.insert(module.clone(), tx).is_some() {
            tracing::debug!(module = %module, "replaced stale refresh waiter");
        }
        rx
    }

    pub(crate) fn forget_refresh(&self, module: &ModuleId) {
        self.waiters.remove(module);
    }

    pub(crate) fn apply(&self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::StateChanged { module, observed } => {
                if let Err(err) = self.machine.reconcile(&module, observed) {
                    tracing::warn!(module = %module, error = %err, "event for unknown module dropped");
                }
            }
            RuntimeEvent::RefreshCompleted { module, result } => {
                match self.waiters.remove(&module) {
                    Some((_, tx)) => {
                        if tx.send(result).is_err() {
                            tracing::debug!(module = %module, "refresh waiter went away");
                        }
                    }
                    None => {
                        tracing::debug!(module = %module, "refresh completion with nobody waiting");
                    }
                }
            }
            RuntimeEvent::Barrier(tx) => {
                if tx.send(()).is_err() {
                    tracing::debug!("barrier dropped before it was reached");
                }
            }
        }
    }

    /// Apply everything already queued without waiting for more.
    pub(crate) fn drain(&self, receiver: &mut EventReceiver) {
        while let Ok(event) = receiver.rx.try_recv() {
            self.apply(event);
        }
    }
}

/// Spawn the task that applies events until `cancel` fires or every sender is gone.
pub(crate) fn spawn_event_pump(
    pump: EventPump,
    mut receiver: EventReceiver,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!("event pump started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = receiver.rx.recv() => match event {
                    Some(event) => pump.apply(event),
                    None => break,
                },
            }
        }
        tracing::debug!("event pump stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IdentityKey, ModuleRecord};
    use crate::registry::ModuleRegistry;

    fn pump_with(id: &str, state: ModuleState) -> (EventPump, Arc<ModuleRegistry>) {
        let registry = Arc::new(ModuleRegistry::new());
        registry
            .insert(ModuleRecord::new(id.into(), IdentityKey::new(id, "1.0")).with_state(state))
            .unwrap();
        (
            EventPump::new(TransitionMachine::new(registry.clone())),
            registry,
        )
    }

    #[test]
    fn drain_applies_queued_events_in_order() {
        let (pump, registry) = pump_with("x", ModuleState::Resolved);
        let (tx, mut rx) = channel();
        assert!(tx.state_changed("x".into(), ModuleState::Active));
        assert!(tx.state_changed("x".into(), ModuleState::Resolved));
        pump.drain(&mut rx);
        assert_eq!(registry.state_of(&"x".into()), Some(ModuleState::Resolved));
    }

    #[tokio::test]
    async fn barrier_follows_earlier_events() {
        let (pump, registry) = pump_with("x", ModuleState::Resolved);
        let (tx, rx) = channel();
        let cancel = CancellationToken::new();
        let handle = spawn_event_pump(pump, rx, cancel.clone());

        tx.state_changed("x".into(), ModuleState::Active);
        tx.barrier().unwrap().await.unwrap();
        assert_eq!(registry.state_of(&"x".into()), Some(ModuleState::Active));

        cancel.cancel();
        handle.await.unwrap();
        assert!(tx.barrier().is_none());
    }

    #[tokio::test]
    async fn refresh_completion_reaches_its_waiter() {
        let (pump, _registry) = pump_with("x", ModuleState::Installed);
        let waiter = pump.wait_for_refresh(&"x".into());
        pump.apply(RuntimeEvent::RefreshCompleted {
            module: "x".into(),
            result: Ok(RuntimeOutcome::done()),
        });
        assert_eq!(waiter.await.unwrap(), Ok(RuntimeOutcome::done()));
    }

    #[test]
    fn unknown_module_events_are_dropped() {
        let (pump, registry) = pump_with("x", ModuleState::Resolved);
        pump.apply(RuntimeEvent::StateChanged {
            module: "ghost".into(),
            observed: ModuleState::Active,
        });
        assert_eq!(registry.len(), 1);
    }
}
