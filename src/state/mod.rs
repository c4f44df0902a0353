// Service lifecycle state machine
//
// Every service owns a StateMachine. Lifecycle operations enter through
// `begin`, which validates the source state and moves the service into the
// operation's transient state, and leave through `finish`. Each transition
// is broadcast as a StateChange so that observers (inspectors, the app
// manager, tests) can follow a service without polling.

use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use std::fmt;
use tokio::sync::broadcast;

/// Lifecycle state of a service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Created,
    Configured,
    /// `start` in progress
    Starting,
    Started,
    /// `swap` in progress
    Swapping,
    /// `stop` in progress
    Stopping,
    Stopped,
    Destroyed,
}

impl ServiceState {
    /// Whether service-defined slots run in this state
    pub fn accepts_slots(self) -> bool {
        matches!(self, ServiceState::Started | ServiceState::Swapping)
    }

    /// A lifecycle operation is currently running
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ServiceState::Starting | ServiceState::Swapping | ServiceState::Stopping
        )
    }

    /// Objects may be bound and unbound
    pub fn is_bindable(self) -> bool {
        matches!(
            self,
            ServiceState::Created | ServiceState::Configured | ServiceState::Stopped
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ServiceState::Created => "created",
            ServiceState::Configured => "configured",
            ServiceState::Starting => "starting",
            ServiceState::Started => "started",
            ServiceState::Swapping => "swapping",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Destroyed => "destroyed",
        };
        f.write_str(text)
    }
}

/// Lifecycle entry points
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Configure,
    Start,
    Update,
    Swap,
    Stop,
    Destroy,
    /// Attach an object to a key
    Bind,
    /// Detach the object bound to a key
    Unbind,
}

impl Operation {
    /// States the operation may be invoked from
    pub fn sources(self) -> &'static [ServiceState] {
        use ServiceState::*;
        match self {
            Operation::Configure | Operation::Start | Operation::Bind | Operation::Unbind => {
                &[Created, Configured, Stopped]
            }
            Operation::Update | Operation::Swap | Operation::Stop => &[Started],
            Operation::Destroy => &[Stopped],
        }
    }

    /// State held while the operation's hook runs
    pub fn transient(self) -> Option<ServiceState> {
        match self {
            Operation::Start => Some(ServiceState::Starting),
            Operation::Swap => Some(ServiceState::Swapping),
            Operation::Stop => Some(ServiceState::Stopping),
            _ => None,
        }
    }

    /// State reached when the operation succeeds; `None` when it leaves the state alone
    pub fn target(self) -> Option<ServiceState> {
        match self {
            Operation::Configure => Some(ServiceState::Configured),
            Operation::Start | Operation::Swap => Some(ServiceState::Started),
            Operation::Stop => Some(ServiceState::Stopped),
            Operation::Destroy => Some(ServiceState::Destroyed),
            Operation::Update | Operation::Bind | Operation::Unbind => None,
        }
    }

    /// Present-participle name used in logs and hook errors
    pub fn phase(self) -> &'static str {
        match self {
            Operation::Configure => "configuring",
            Operation::Start => "starting",
            Operation::Update => "updating",
            Operation::Swap => "swapping",
            Operation::Stop => "stopping",
            Operation::Destroy => "destroying",
            Operation::Bind => "binding",
            Operation::Unbind => "unbinding",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Operation::Configure => "configure",
            Operation::Start => "start",
            Operation::Update => "update",
            Operation::Swap => "swap",
            Operation::Stop => "stop",
            Operation::Destroy => "destroy",
            Operation::Bind => "bind",
            Operation::Unbind => "unbind",
        };
        f.write_str(text)
    }
}

/// Transition event broadcast by a [`StateMachine`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateChange {
    pub service: String,
    pub from: ServiceState,
    pub to: ServiceState,
}

/// Thread-safe lifecycle state with change broadcasting
///
/// Validation and the move into the transient state happen under one write
/// lock, so two racing lifecycle calls cannot both pass validation.
pub struct StateMachine {
    service: String,
    state: RwLock<ServiceState>,
    state_tx: broadcast::Sender<StateChange>,
}

impl StateMachine {
    /// Create a machine in [`ServiceState::Created`] with a 64-event buffer
    pub fn new(service: impl Into<String>) -> Self {
        let (state_tx, _) = broadcast::channel(64);
        Self {
            service: service.into(),
            state: RwLock::new(ServiceState::Created),
            state_tx,
        }
    }

    pub fn current(&self) -> ServiceState {
        *self.state.read()
    }

    /// Validate `operation` against the current state and enter its transient state
    ///
    /// Returns the state the service was in before the call.
    pub fn begin(&self, operation: Operation) -> CoreResult<ServiceState> {
        let mut state = self.state.write();
        let previous = *state;

        if !operation.sources().contains(&previous) {
            return Err(CoreError::invalid_state(&self.service, operation, previous));
        }

        if let Some(transient) = operation.transient() {
            *state = transient;
            drop(state);
            self.broadcast(previous, transient);
        }

        Ok(previous)
    }

    /// Validate `operation` without changing state
    pub fn check(&self, operation: Operation) -> CoreResult<ServiceState> {
        let state = self.current();
        if operation.sources().contains(&state) {
            Ok(state)
        } else {
            Err(CoreError::invalid_state(&self.service, operation, state))
        }
    }

    /// Move to `to`, broadcasting if the state actually changed
    pub fn finish(&self, to: ServiceState) {
        let from = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, to)
        };

        if from != to {
            tracing::debug!("Service '{}': {} -> {}", self.service, from, to);
            self.broadcast(from, to);
        }
    }

    /// Receive every future transition
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    fn broadcast(&self, from: ServiceState, to: ServiceState) {
        // No subscribers is fine
        let _ = self.state_tx.send(StateChange {
            service: self.service.clone(),
            from,
            to,
        });
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("service", &self.service)
            .field("state", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(machine: &StateMachine, operation: Operation) -> CoreResult<()> {
        machine.begin(operation)?;
        if let Some(target) = operation.target() {
            machine.finish(target);
        }
        Ok(())
    }

    #[test]
    fn test_full_lifecycle() {
        let machine = StateMachine::new("viewer");
        assert_eq!(machine.current(), ServiceState::Created);

        run(&machine, Operation::Configure).unwrap();
        run(&machine, Operation::Start).unwrap();
        run(&machine, Operation::Update).unwrap();
        run(&machine, Operation::Swap).unwrap();
        run(&machine, Operation::Stop).unwrap();
        run(&machine, Operation::Destroy).unwrap();
        assert_eq!(machine.current(), ServiceState::Destroyed);
    }

    #[test]
    fn test_restart_after_stop() {
        let machine = StateMachine::new("viewer");
        run(&machine, Operation::Start).unwrap();
        run(&machine, Operation::Stop).unwrap();
        run(&machine, Operation::Configure).unwrap();
        run(&machine, Operation::Start).unwrap();
        assert_eq!(machine.current(), ServiceState::Started);
    }

    #[test]
    fn test_illegal_operations() {
        let machine = StateMachine::new("viewer");

        for operation in [Operation::Update, Operation::Swap, Operation::Stop, Operation::Destroy] {
            let err = machine.begin(operation).unwrap_err();
            assert!(matches!(
                err,
                CoreError::InvalidState { state: ServiceState::Created, .. }
            ));
        }

        run(&machine, Operation::Start).unwrap();
        assert!(machine.begin(Operation::Start).is_err());
        assert!(machine.begin(Operation::Configure).is_err());
        assert!(machine.begin(Operation::Destroy).is_err());
        assert_eq!(machine.current(), ServiceState::Started);
    }

    #[test]
    fn test_transient_state_rejects_concurrent_calls() {
        let machine = StateMachine::new("viewer");
        assert_eq!(machine.begin(Operation::Start).unwrap(), ServiceState::Created);
        assert_eq!(machine.current(), ServiceState::Starting);
        assert!(machine.current().is_transient());

        assert!(machine.begin(Operation::Start).is_err());
        assert!(machine.begin(Operation::Stop).is_err());
    }

    #[test]
    fn test_slots_accepted_only_while_running() {
        assert!(ServiceState::Started.accepts_slots());
        assert!(ServiceState::Swapping.accepts_slots());
        assert!(!ServiceState::Starting.accepts_slots());
        assert!(!ServiceState::Stopping.accepts_slots());
        assert!(!ServiceState::Stopped.accepts_slots());
    }

    #[test]
    fn test_transitions_are_broadcast() {
        let machine = StateMachine::new("viewer");
        let mut rx = machine.subscribe();

        run(&machine, Operation::Start).unwrap();
        run(&machine, Operation::Update).unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(
            first,
            StateChange {
                service: "viewer".to_string(),
                from: ServiceState::Created,
                to: ServiceState::Starting,
            }
        );
        let second = rx.try_recv().unwrap();
        assert_eq!((second.from, second.to), (ServiceState::Starting, ServiceState::Started));

        // update does not change the state
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_bind_is_checked_without_transition() {
        let machine = StateMachine::new("viewer");
        assert_eq!(machine.check(Operation::Bind).unwrap(), ServiceState::Created);

        run(&machine, Operation::Start).unwrap();
        assert!(machine.check(Operation::Unbind).is_err());
        assert_eq!(machine.current(), ServiceState::Started);
    }

    #[test]
    fn test_display_is_lowercase() {
        assert_eq!(Operation::Swap.to_string(), "swap");
        assert_eq!(ServiceState::Configured.to_string(), "configured");
        assert_eq!(Operation::Stop.phase(), "stopping");
    }
}
