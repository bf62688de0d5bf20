use super::controller::{DependencyWait, ReadinessController, StartGate};
use super::error::CoordinationError;
use super::probe::{ProbeOutcome, ProbeRunner, Prober};
use super::state::ServiceState;
use crate::config::stack::ServiceSpec;
use crate::metrics::metrics;
use crate::runtime::{sleep_with_shutdown, ServiceRuntime};
use crate::service_event;
use crate::supervisor::{RestartDecision, RestartSupervisor, StopReason, Termination};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkerEvent {
    Healthy { service: String },
    /// A service that had reported healthy terminated.
    Unhealthy { service: String },
    GaveUp { service: String, error: CoordinationError },
    OperatorStopped { service: String },
}

enum Cycle {
    Cancelled,
    Terminated(Termination),
    Abandoned(CoordinationError),
}

/// Lifecycle task for one service. Runs until the service is stopped for
/// good or its token is cancelled.
pub(crate) struct ServiceWorker {
    pub(crate) spec: Arc<ServiceSpec>,
    pub(crate) controller: ReadinessController,
    pub(crate) runtime: Arc<dyn ServiceRuntime>,
    pub(crate) prober: Arc<dyn Prober>,
    pub(crate) supervisor: RestartSupervisor,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) start_timeout: Duration,
    pub(crate) stop_timeout: Duration,
    pub(crate) events: mpsc::UnboundedSender<WorkerEvent>,
    pub(crate) token: CancellationToken,
}

impl ServiceWorker {
    fn name(&self) -> &str {
        &self.spec.name
    }

    pub(crate) async fn run(self) {
        loop {
            let termination = match self.run_once().await {
                Cycle::Cancelled => {
                    self.finish_cancelled().await;
                    return;
                }
                Cycle::Abandoned(error) => {
                    self.transition(ServiceState::Stopped, Some(error.to_string()))
                        .await;
                    self.emit(WorkerEvent::GaveUp {
                        service: self.name().to_string(),
                        error,
                    });
                    return;
                }
                Cycle::Terminated(termination) => termination,
            };

            match self
                .supervisor
                .decide(self.name(), self.spec.restart, &termination)
            {
                RestartDecision::Restart { attempt, delay } => {
                    service_event!(
                        info,
                        "service restart pending",
                        service = self.name(),
                        attempt = attempt,
                        delay = humantime::format_duration(delay)
                    );
                    if sleep_with_shutdown(delay, &self.token).await {
                        self.finish_cancelled().await;
                        return;
                    }
                }
                RestartDecision::Stop(StopReason::OperatorStopped) => {
                    self.finish_cancelled().await;
                    return;
                }
                RestartDecision::Stop(reason) => {
                    self.transition(ServiceState::Stopped, Some(reason.as_str().to_string()))
                        .await;
                    self.emit(WorkerEvent::GaveUp {
                        service: self.name().to_string(),
                        error: termination.into_error(self.name()),
                    });
                    return;
                }
            }
        }
    }

    async fn run_once(&self) -> Cycle {
        let permit = loop {
            let unmet = self.controller.unmet_dependencies(self.name()).await;
            if !unmet.is_empty() {
                let waiting_on = unmet
                    .iter()
                    .map(|dep| format!("{} ({})", dep.dependency, dep.actual))
                    .collect::<Vec<_>>()
                    .join(", ");
                self.transition(
                    ServiceState::WaitingOnDependencies,
                    Some(format!("waiting on {waiting_on}")),
                )
                .await;

                match self
                    .controller
                    .wait_for_dependencies(self.name(), &self.token)
                    .await
                {
                    DependencyWait::Satisfied => {}
                    DependencyWait::Cancelled => return Cycle::Cancelled,
                    DependencyWait::DependencyStopped(dependency) => {
                        return Cycle::Abandoned(CoordinationError::DependencyStopped {
                            service: self.name().to_string(),
                            dependency,
                        });
                    }
                }
            }

            let permit = tokio::select! {
                _ = self.token.cancelled() => return Cycle::Cancelled,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(err) => {
                        return Cycle::Abandoned(CoordinationError::StartError {
                            service: self.name().to_string(),
                            reason: format!("start permits unavailable: {err}"),
                        });
                    }
                },
            };

            match self.controller.try_begin_start(self.name()).await {
                Ok(StartGate::Started) => break permit,
                Ok(StartGate::Blocked(_)) => drop(permit),
                Err(err) => return Cycle::Abandoned(err),
            }
        };

        let started_at = Instant::now();
        let start = tokio::select! {
            _ = self.token.cancelled() => return Cycle::Cancelled,
            result = timeout(self.start_timeout, self.runtime.start(&self.spec)) => result,
        };

        let reason = match start {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => {
                self.stop_process().await;
                Some(format!(
                    "start timed out after {}",
                    humantime::format_duration(self.start_timeout)
                ))
            }
        };
        if let Some(reason) = reason {
            self.transition(ServiceState::Failed, Some(reason.clone()))
                .await;
            return Cycle::Terminated(Termination::StartFailed { reason });
        }

        self.transition(ServiceState::ProbingHealth, None).await;

        let probe = async {
            match &self.spec.probe {
                Some(probe) => {
                    ProbeRunner::new(self.name(), probe, self.prober.as_ref())
                        .run(&self.token)
                        .await
                }
                None => ProbeOutcome::Healthy { attempts: 0 },
            }
        };

        let outcome = tokio::select! {
            outcome = probe => outcome,
            exit = self.runtime.wait_exit(self.name()) => {
                if self.token.is_cancelled() {
                    return Cycle::Cancelled;
                }
                self.transition(ServiceState::Failed, Some(format!("process exited ({exit}) while probing")))
                    .await;
                return Cycle::Terminated(Termination::Exited(exit));
            }
        };
        drop(permit);

        match outcome {
            ProbeOutcome::Healthy { attempts } => {
                self.transition(ServiceState::Healthy, None).await;
                metrics().record_time_to_healthy(self.name(), started_at.elapsed());
                self.supervisor.record_healthy(self.name());
                service_event!(
                    info,
                    "service healthy",
                    service = self.name(),
                    probe_attempts = attempts,
                    elapsed_ms = started_at.elapsed().as_millis()
                );
                self.emit(WorkerEvent::Healthy {
                    service: self.name().to_string(),
                });
            }
            ProbeOutcome::Failed {
                attempts,
                last_error,
            } => {
                let termination = Termination::ProbeFailed {
                    attempts,
                    last_error: last_error.to_string(),
                };
                self.stop_process().await;
                self.transition(ServiceState::Failed, Some(termination.describe()))
                    .await;
                return Cycle::Terminated(termination);
            }
            ProbeOutcome::Cancelled { .. } => return Cycle::Cancelled,
        }

        let exit = tokio::select! {
            _ = self.token.cancelled() => return Cycle::Cancelled,
            exit = self.runtime.wait_exit(self.name()) => exit,
        };
        if self.token.is_cancelled() {
            return Cycle::Cancelled;
        }

        let termination = Termination::Exited(exit);
        self.transition(ServiceState::Failed, Some(termination.describe()))
            .await;
        self.emit(WorkerEvent::Unhealthy {
            service: self.name().to_string(),
        });
        Cycle::Terminated(termination)
    }

    async fn finish_cancelled(&self) {
        if !self.supervisor.is_operator_stopped(self.name()) {
            // Stack shutdown: the coordinator stops processes in reverse order.
            return;
        }

        self.stop_process().await;
        self.transition(
            ServiceState::Stopped,
            Some(StopReason::OperatorStopped.as_str().to_string()),
        )
        .await;
        self.emit(WorkerEvent::OperatorStopped {
            service: self.name().to_string(),
        });
    }

    async fn stop_process(&self) {
        let stop_timeout = self.spec.stop_timeout.unwrap_or(self.stop_timeout);
        match timeout(stop_timeout, self.runtime.stop(self.name())).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(service = self.name(), error = %err, "failed to stop service");
            }
            Err(_) => {
                tracing::warn!(
                    service = self.name(),
                    timeout_ms = stop_timeout.as_millis() as u64,
                    "service did not stop in time"
                );
            }
        }
    }

    async fn transition(&self, state: ServiceState, reason: Option<String>) {
        if let Err(err) = self.controller.set_state(self.name(), state, reason).await {
            tracing::warn!(
                service = self.name(),
                state = state.as_str(),
                error = %err,
                "service state transition rejected"
            );
        }
    }

    fn emit(&self, event: WorkerEvent) {
        // The coordinator may already be gone during shutdown.
        let _ = self.events.send(event);
    }
}
