use super::error::CoordinationError;
use super::state::{
    ServiceState, ServiceStateMachine, StackState, TransitionError, TransitionRecord,
};
use crate::config::stack::{Dependency, DependencyCondition};
use crate::registry::ServiceRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

/// Shared view of every service's lifecycle state.
///
/// All transitions go through the state machine under one write lock; the
/// per-service watch channels are updated under that same lock so waiters
/// never observe a state the machine has not recorded.
#[derive(Clone)]
pub struct ReadinessController {
    machine: Arc<RwLock<ServiceStateMachine>>,
    watchers: Arc<BTreeMap<String, watch::Sender<ServiceState>>>,
    dependencies: Arc<BTreeMap<String, Vec<Dependency>>>,
    cache: Arc<RwLock<Option<CachedSnapshot>>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnmetDependency {
    pub dependency: String,
    pub condition: DependencyCondition,
    pub actual: ServiceState,
}

/// Result of an atomic dependency check plus `Starting` transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartGate {
    Started,
    Blocked(Vec<UnmetDependency>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DependencyWait {
    Satisfied,
    Cancelled,
    DependencyStopped(String),
}

impl ReadinessController {
    pub fn from_registry(registry: &ServiceRegistry) -> Self {
        let names = registry
            .names()
            .map(str::to_string)
            .collect::<Vec<_>>();

        let watchers = names
            .iter()
            .map(|name| {
                let (tx, _rx) = watch::channel(ServiceState::Pending);
                (name.clone(), tx)
            })
            .collect();

        let dependencies = registry
            .iter()
            .map(|spec| (spec.name.clone(), spec.depends_on.clone()))
            .collect();

        Self {
            machine: Arc::new(RwLock::new(ServiceStateMachine::new(names))),
            watchers: Arc::new(watchers),
            dependencies: Arc::new(dependencies),
            cache: Arc::new(RwLock::new(None)),
        }
    }

    pub fn service_count(&self) -> usize {
        self.watchers.len()
    }

    pub async fn service_state(&self, service: &str) -> Option<ServiceState> {
        let guard = self.machine.read().await;
        guard.state(service)
    }

    pub async fn stack_state(&self) -> StackState {
        let guard = self.machine.read().await;
        guard.stack_state()
    }

    pub fn dependencies_of(&self, service: &str) -> &[Dependency] {
        self.dependencies
            .get(service)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn subscribe(&self, service: &str) -> Option<watch::Receiver<ServiceState>> {
        self.watchers.get(service).map(watch::Sender::subscribe)
    }

    /// Applies a transition. Entering `Starting` is refused with
    /// `DependencyUnmet` unless every dependency satisfies its condition.
    pub async fn set_state(
        &self,
        service: &str,
        state: ServiceState,
        reason: Option<String>,
    ) -> Result<ServiceState, CoordinationError> {
        let mut guard = self.machine.write().await;

        if state == ServiceState::Starting && guard.state(service) != Some(ServiceState::Starting) {
            if let Some(unmet) = self.unmet_in(&guard, service).into_iter().next() {
                return Err(CoordinationError::DependencyUnmet {
                    service: service.to_string(),
                    dependency: unmet.dependency,
                    condition: unmet.condition,
                    actual: unmet.actual,
                });
            }
        }

        let transition = self.apply(&mut guard, service, state, reason.clone());
        drop(guard);

        let (from, to) = transition?;
        if from != to {
            log_transition(service, from, to, reason.as_deref());
        }
        Ok(to)
    }

    /// Checks dependencies and enters `Starting` in one step.
    pub async fn try_begin_start(&self, service: &str) -> Result<StartGate, CoordinationError> {
        let mut guard = self.machine.write().await;
        let unmet = self.unmet_in(&guard, service);
        if !unmet.is_empty() {
            return Ok(StartGate::Blocked(unmet));
        }

        let (from, to) = self.apply(&mut guard, service, ServiceState::Starting, None)?;
        drop(guard);

        if from != to {
            log_transition(service, from, to, None);
        }
        Ok(StartGate::Started)
    }

    pub async fn unmet_dependencies(&self, service: &str) -> Vec<UnmetDependency> {
        let guard = self.machine.read().await;
        self.unmet_in(&guard, service)
    }

    /// Waits until every dependency of `service` satisfies its condition.
    ///
    /// Dependencies are awaited one after the other, so an earlier dependency
    /// may have regressed by the time this returns; callers re-check through
    /// [`ReadinessController::try_begin_start`].
    pub async fn wait_for_dependencies(
        &self,
        service: &str,
        cancel: &CancellationToken,
    ) -> DependencyWait {
        for dependency in self.dependencies_of(service) {
            let Some(mut rx) = self.subscribe(&dependency.name) else {
                return DependencyWait::DependencyStopped(dependency.name.clone());
            };

            loop {
                let current = *rx.borrow_and_update();
                if current.satisfies(dependency.condition) {
                    break;
                }
                if current.is_terminal() {
                    return DependencyWait::DependencyStopped(dependency.name.clone());
                }

                tokio::select! {
                    _ = cancel.cancelled() => return DependencyWait::Cancelled,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return DependencyWait::DependencyStopped(dependency.name.clone());
                        }
                    }
                }
            }
        }

        DependencyWait::Satisfied
    }

    pub async fn stop_all(&self, reason: &str) {
        let mut guard = self.machine.write().await;
        let transitions = guard.stop_all(reason);
        for (service, _) in &transitions {
            if let Some(tx) = self.watchers.get(service) {
                tx.send_replace(ServiceState::Stopped);
            }
        }
        drop(guard);

        for (service, from) in transitions {
            log_transition(&service, from, ServiceState::Stopped, Some(reason));
        }
    }

    pub async fn history(&self) -> Vec<TransitionRecord> {
        let guard = self.machine.read().await;
        guard.history()
    }

    async fn build_snapshot(&self) -> StackSnapshot {
        let guard = self.machine.read().await;
        let stack_state = guard.stack_state();

        let services = guard
            .service_states()
            .into_iter()
            .map(|(name, state)| {
                let dependencies = self
                    .dependencies_of(&name)
                    .iter()
                    .map(|dep| dep.name.clone())
                    .collect();
                let unmet = self
                    .unmet_in(&guard, &name)
                    .into_iter()
                    .map(|dep| dep.dependency)
                    .collect();

                ServiceStatusSnapshot {
                    reason: guard.reason(&name).map(str::to_string),
                    restarts: guard.restarts(&name).unwrap_or(0),
                    name,
                    state,
                    dependencies,
                    unmet,
                }
            })
            .collect();

        StackSnapshot {
            stack_state,
            services,
        }
    }

    pub async fn status_snapshot(&self) -> StackSnapshot {
        self.build_snapshot().await
    }

    pub async fn cached_snapshot(&self, ttl: Duration) -> StackSnapshot {
        if ttl.is_zero() {
            return self.build_snapshot().await;
        }

        let now = Instant::now();
        {
            let cache_guard = self.cache.read().await;
            if let Some(cached) = cache_guard.as_ref() {
                if now.duration_since(cached.observed_at) <= ttl {
                    return cached.snapshot.clone();
                }
            }
        }

        let snapshot = self.build_snapshot().await;
        let mut cache_guard = self.cache.write().await;
        *cache_guard = Some(CachedSnapshot {
            snapshot: snapshot.clone(),
            observed_at: now,
        });
        snapshot
    }

    /// Dependents keyed by the service they depend on.
    pub fn dependents_by_service(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (service, deps) in self.dependencies.iter() {
            for dep in deps {
                map.entry(dep.name.clone())
                    .or_default()
                    .push(service.clone());
            }
        }
        map
    }

    fn unmet_in(&self, machine: &ServiceStateMachine, service: &str) -> Vec<UnmetDependency> {
        self.dependencies_of(service)
            .iter()
            .filter_map(|dep| {
                let actual = machine.state(&dep.name).unwrap_or(ServiceState::Stopped);
                (!actual.satisfies(dep.condition)).then(|| UnmetDependency {
                    dependency: dep.name.clone(),
                    condition: dep.condition,
                    actual,
                })
            })
            .collect()
    }

    fn apply(
        &self,
        machine: &mut ServiceStateMachine,
        service: &str,
        state: ServiceState,
        reason: Option<String>,
    ) -> Result<(ServiceState, ServiceState), TransitionError> {
        let from = machine
            .state(service)
            .ok_or_else(|| TransitionError::ServiceUnknown {
                service: service.to_string(),
            })?;
        let to = machine.set_state(service, state, reason)?;
        if from != to {
            if let Some(tx) = self.watchers.get(service) {
                tx.send_replace(to);
            }
        }
        Ok((from, to))
    }
}

fn log_transition(service: &str, from: ServiceState, to: ServiceState, reason: Option<&str>) {
    tracing::info!(
        service = service,
        state_from = from.as_str(),
        state_to = to.as_str(),
        reason = reason.unwrap_or(""),
        "service state transition"
    );
}

/// Convert the readiness cache window into the Retry-After hint advertised by the management API.
pub fn retry_after_hint_seconds(cache: Duration) -> u64 {
    crate::retry::duration_to_seconds(cache)
}

#[derive(Clone, Debug)]
pub struct StackSnapshot {
    pub stack_state: StackState,
    pub services: Vec<ServiceStatusSnapshot>,
}

#[derive(Clone, Debug)]
pub struct ServiceStatusSnapshot {
    pub name: String,
    pub state: ServiceState,
    pub reason: Option<String>,
    pub restarts: u32,
    pub dependencies: Vec<String>,
    pub unmet: Vec<String>,
}

struct CachedSnapshot {
    snapshot: StackSnapshot,
    observed_at: Instant,
}
