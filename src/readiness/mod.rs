pub mod controller;
pub mod coordinator;
pub mod error;
pub mod graph;
pub mod probe;
pub mod state;
mod worker;

pub use controller::{
    retry_after_hint_seconds, DependencyWait, ReadinessController, ServiceStatusSnapshot,
    StackSnapshot, StartGate, UnmetDependency,
};
pub use coordinator::{RunningStack, StackHandle, StartupCoordinator, StartupReport};
pub use error::CoordinationError;
pub use graph::{DependencyEdge, DependencyGraph, GraphNode};
pub use probe::{ProbeError, ProbeOutcome, ProbeRunner, Prober, SystemProber};
pub use state::{
    ServiceState, ServiceStateMachine, StackState, TransitionError, TransitionRecord,
};
