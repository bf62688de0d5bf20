use crate::config::stack::{RestartBudget, RestartPolicy};
use crate::metrics::metrics;
use crate::readiness::CoordinationError;
use crate::retry::restart_delay;
use crate::runtime::ProcessExit;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Why a service left its running lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Termination {
    StartFailed { reason: String },
    ProbeFailed { attempts: u32, last_error: String },
    Exited(ProcessExit),
}

impl Termination {
    pub fn is_failure(&self) -> bool {
        match self {
            Termination::StartFailed { .. } | Termination::ProbeFailed { .. } => true,
            Termination::Exited(exit) => !exit.success(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Termination::StartFailed { reason } => reason.clone(),
            Termination::ProbeFailed {
                attempts,
                last_error,
            } => format!("health probe failed after {attempts} attempt(s): {last_error}"),
            Termination::Exited(exit) => format!("process exited ({exit})"),
        }
    }

    pub fn into_error(self, service: &str) -> CoordinationError {
        let service = service.to_string();
        match self {
            Termination::StartFailed { reason } => CoordinationError::StartError { service, reason },
            Termination::ProbeFailed {
                attempts,
                last_error,
            } => CoordinationError::ProbeTimeout {
                service,
                attempts,
                last_error,
            },
            Termination::Exited(exit) => CoordinationError::ServiceExited {
                service,
                code: exit.code,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    OperatorStopped,
    PolicyNever,
    CleanExit,
    BudgetExhausted,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::OperatorStopped => "stopped by operator",
            StopReason::PolicyNever => "restart policy is never",
            StopReason::CleanExit => "exited cleanly under on-failure",
            StopReason::BudgetExhausted => "restart budget exhausted",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { attempt: u32, delay: Duration },
    Stop(StopReason),
}

/// Restart policy table. `always` and `unless-stopped` only differ for a
/// daemon restart, which muster does not have, so they behave the same.
pub fn policy_allows_restart(
    policy: RestartPolicy,
    termination: &Termination,
    operator_stopped: bool,
) -> bool {
    if operator_stopped {
        return false;
    }
    match policy {
        RestartPolicy::Always | RestartPolicy::UnlessStopped => true,
        RestartPolicy::OnFailure => termination.is_failure(),
        RestartPolicy::Never => false,
    }
}

/// Per-service restart accounting: a rolling budget window plus the
/// consecutive-failure count that drives exponential backoff.
#[derive(Clone, Debug)]
pub struct RestartTracker {
    budget: RestartBudget,
    recent: VecDeque<Instant>,
    consecutive_failures: u32,
}

impl RestartTracker {
    pub fn new(budget: RestartBudget) -> Self {
        Self {
            budget,
            recent: VecDeque::new(),
            consecutive_failures: 0,
        }
    }

    /// Reserves one restart. Returns `None` while `max_restarts` restarts
    /// already happened within the trailing window.
    pub fn next_restart(&mut self, now: Instant) -> Option<(u32, Duration)> {
        while let Some(oldest) = self.recent.front() {
            if now.saturating_duration_since(*oldest) >= self.budget.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }

        if let Some(max_restarts) = self.budget.max_restarts {
            if self.recent.len() >= max_restarts as usize {
                return None;
            }
        }

        self.recent.push_back(now);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let attempt = self.consecutive_failures;
        Some((attempt, restart_delay(&self.budget, attempt)))
    }

    /// Resets backoff after the service reached `Healthy`. The window count is kept.
    pub fn record_healthy(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Restarts counted at the last `next_restart` call.
    pub fn restarts_in_window(&self) -> u32 {
        u32::try_from(self.recent.len()).unwrap_or(u32::MAX)
    }
}

/// Decides what happens after a service terminates, and owns the
/// cancellation token of each service's lifecycle task.
#[derive(Clone)]
pub struct RestartSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    tokens: BTreeMap<String, CancellationToken>,
    operator_stopped: Mutex<BTreeSet<String>>,
    trackers: Mutex<HashMap<String, RestartTracker>>,
}

impl RestartSupervisor {
    pub fn new<'a>(
        services: impl IntoIterator<Item = &'a str>,
        budget: RestartBudget,
        shutdown: &CancellationToken,
    ) -> Self {
        let mut tokens = BTreeMap::new();
        let mut trackers = HashMap::new();
        for service in services {
            tokens.insert(service.to_string(), shutdown.child_token());
            trackers.insert(service.to_string(), RestartTracker::new(budget.clone()));
        }

        Self {
            inner: Arc::new(SupervisorInner {
                tokens,
                operator_stopped: Mutex::new(BTreeSet::new()),
                trackers: Mutex::new(trackers),
            }),
        }
    }

    pub fn token(&self, service: &str) -> Option<CancellationToken> {
        self.inner.tokens.get(service).cloned()
    }

    pub fn contains(&self, service: &str) -> bool {
        self.inner.tokens.contains_key(service)
    }

    /// Marks `service` operator-stopped and cancels its lifecycle task.
    /// Returns `false` for services that are not supervised.
    pub fn stop_service(&self, service: &str) -> bool {
        let Some(token) = self.inner.tokens.get(service) else {
            return false;
        };
        self.inner
            .operator_stopped
            .lock()
            .expect("operator stop set poisoned")
            .insert(service.to_string());
        token.cancel();
        tracing::info!(service = service, "service stop requested by operator");
        true
    }

    pub fn is_operator_stopped(&self, service: &str) -> bool {
        self.inner
            .operator_stopped
            .lock()
            .expect("operator stop set poisoned")
            .contains(service)
    }

    pub fn record_healthy(&self, service: &str) {
        if let Some(tracker) = self
            .inner
            .trackers
            .lock()
            .expect("restart trackers poisoned")
            .get_mut(service)
        {
            tracker.record_healthy();
        }
    }

    pub fn decide(
        &self,
        service: &str,
        policy: RestartPolicy,
        termination: &Termination,
    ) -> RestartDecision {
        let operator_stopped = self.is_operator_stopped(service);
        if !policy_allows_restart(policy, termination, operator_stopped) {
            let reason = if operator_stopped {
                StopReason::OperatorStopped
            } else if policy == RestartPolicy::OnFailure {
                StopReason::CleanExit
            } else {
                StopReason::PolicyNever
            };
            tracing::info!(
                service = service,
                policy = policy.as_str(),
                outcome = %termination.describe(),
                reason = reason.as_str(),
                "service will not be restarted"
            );
            return RestartDecision::Stop(reason);
        }

        let reserved = self
            .inner
            .trackers
            .lock()
            .expect("restart trackers poisoned")
            .get_mut(service)
            .and_then(|tracker| tracker.next_restart(Instant::now()));

        match reserved {
            Some((attempt, delay)) => {
                metrics().record_restart(service);
                tracing::warn!(
                    service = service,
                    policy = policy.as_str(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    outcome = %termination.describe(),
                    "scheduling service restart"
                );
                RestartDecision::Restart { attempt, delay }
            }
            None => {
                tracing::error!(
                    service = service,
                    policy = policy.as_str(),
                    outcome = %termination.describe(),
                    "restart budget exhausted; giving up on service"
                );
                RestartDecision::Stop(StopReason::BudgetExhausted)
            }
        }
    }
}
