use crate::config::stack::DependencyCondition;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Pending,
    WaitingOnDependencies,
    Starting,
    ProbingHealth,
    Healthy,
    Failed,
    Stopped,
}

impl ServiceState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceState::Pending => "PENDING",
            ServiceState::WaitingOnDependencies => "WAITING_ON_DEPENDENCIES",
            ServiceState::Starting => "STARTING",
            ServiceState::ProbingHealth => "PROBING_HEALTH",
            ServiceState::Healthy => "HEALTHY",
            ServiceState::Failed => "FAILED",
            ServiceState::Stopped => "STOPPED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceState::Stopped)
    }

    /// Whether a dependency in this state satisfies `condition` for its dependents.
    pub fn satisfies(self, condition: DependencyCondition) -> bool {
        match condition {
            DependencyCondition::Healthy => self == ServiceState::Healthy,
            DependencyCondition::Started => matches!(
                self,
                ServiceState::Starting | ServiceState::ProbingHealth | ServiceState::Healthy
            ),
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackState {
    Starting,
    Healthy,
    Degraded,
    Stopped,
}

impl StackState {
    pub fn as_str(self) -> &'static str {
        match self {
            StackState::Starting => "STARTING",
            StackState::Healthy => "HEALTHY",
            StackState::Degraded => "DEGRADED",
            StackState::Stopped => "STOPPED",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("service `{service}` is not registered")]
    ServiceUnknown { service: String },
    #[error("service `{service}` cannot move from {from} to {to}")]
    InvalidTransition {
        service: String,
        from: ServiceState,
        to: ServiceState,
    },
}

/// One applied state change. `sequence` is global across services.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionRecord {
    pub sequence: u64,
    pub service: String,
    pub from: ServiceState,
    pub to: ServiceState,
    pub reason: Option<String>,
}

struct ServiceEntry {
    state: ServiceState,
    reason: Option<String>,
    restarts: u32,
}

/// Transitions kept in the history before the oldest are dropped.
pub const DEFAULT_HISTORY_LIMIT: usize = 4096;

pub struct ServiceStateMachine {
    services: BTreeMap<String, ServiceEntry>,
    history: VecDeque<TransitionRecord>,
    history_limit: usize,
    next_sequence: u64,
}

impl ServiceStateMachine {
    pub fn new(services: impl IntoIterator<Item = String>) -> Self {
        let services = services
            .into_iter()
            .map(|name| {
                (
                    name,
                    ServiceEntry {
                        state: ServiceState::Pending,
                        reason: None,
                        restarts: 0,
                    },
                )
            })
            .collect();

        Self {
            services,
            history: VecDeque::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            next_sequence: 0,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        self
    }

    pub fn state(&self, service: &str) -> Option<ServiceState> {
        self.services.get(service).map(|entry| entry.state)
    }

    pub fn reason(&self, service: &str) -> Option<&str> {
        self.services
            .get(service)
            .and_then(|entry| entry.reason.as_deref())
    }

    pub fn restarts(&self, service: &str) -> Option<u32> {
        self.services.get(service).map(|entry| entry.restarts)
    }

    pub fn set_state(
        &mut self,
        service: &str,
        next: ServiceState,
        reason: Option<String>,
    ) -> Result<ServiceState, TransitionError> {
        let entry = self
            .services
            .get_mut(service)
            .ok_or_else(|| TransitionError::ServiceUnknown {
                service: service.to_string(),
            })?;

        let current = entry.state;
        if current == next {
            if reason.is_some() {
                entry.reason = reason;
            }
            return Ok(current);
        }

        if !Self::is_valid_transition(current, next) {
            return Err(TransitionError::InvalidTransition {
                service: service.to_string(),
                from: current,
                to: next,
            });
        }

        if current == ServiceState::Failed
            && matches!(
                next,
                ServiceState::Starting | ServiceState::WaitingOnDependencies
            )
        {
            entry.restarts = entry.restarts.saturating_add(1);
        }

        entry.state = next;
        entry.reason = reason.clone();

        if self.history.len() >= self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(TransitionRecord {
            sequence: self.next_sequence,
            service: service.to_string(),
            from: current,
            to: next,
            reason,
        });
        self.next_sequence += 1;

        Ok(next)
    }

    fn is_valid_transition(current: ServiceState, next: ServiceState) -> bool {
        use ServiceState::*;

        if next == Stopped {
            return current != Stopped;
        }

        match current {
            Pending => matches!(next, WaitingOnDependencies | Starting),
            WaitingOnDependencies => matches!(next, Starting),
            Starting => matches!(next, ProbingHealth | Failed),
            ProbingHealth => matches!(next, Healthy | Failed),
            Healthy => matches!(next, Failed),
            Failed => matches!(next, Starting | WaitingOnDependencies),
            Stopped => false,
        }
    }

    /// Moves every service that is not already stopped to `Stopped`.
    pub fn stop_all(&mut self, reason: &str) -> Vec<(String, ServiceState)> {
        let names = self
            .services
            .iter()
            .filter(|(_, entry)| entry.state != ServiceState::Stopped)
            .map(|(name, entry)| (name.clone(), entry.state))
            .collect::<Vec<_>>();

        for (name, _) in &names {
            let _ = self.set_state(name, ServiceState::Stopped, Some(reason.to_string()));
        }

        names
    }

    pub fn stack_state(&self) -> StackState {
        if self.services.is_empty() {
            return StackState::Healthy;
        }

        let mut all_healthy = true;
        let mut all_stopped = true;
        let mut any_down = false;

        for entry in self.services.values() {
            all_healthy &= entry.state == ServiceState::Healthy;
            all_stopped &= entry.state == ServiceState::Stopped;
            any_down |= matches!(entry.state, ServiceState::Failed | ServiceState::Stopped);
        }

        if all_healthy {
            StackState::Healthy
        } else if all_stopped {
            StackState::Stopped
        } else if any_down {
            StackState::Degraded
        } else {
            StackState::Starting
        }
    }

    pub fn service_states(&self) -> Vec<(String, ServiceState)> {
        self.services
            .iter()
            .map(|(name, entry)| (name.clone(), entry.state))
            .collect()
    }

    /// The most recent transitions, oldest first.
    pub fn history(&self) -> Vec<TransitionRecord> {
        self.history.iter().cloned().collect()
    }
}
