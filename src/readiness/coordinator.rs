use super::controller::ReadinessController;
use super::error::CoordinationError;
use super::graph::DependencyGraph;
use super::probe::Prober;
use super::state::{ServiceState, StackState};
use super::worker::{ServiceWorker, WorkerEvent};
use crate::config::stack::AppConfig;
use crate::metrics::metrics;
use crate::registry::ServiceRegistry;
use crate::runtime::ServiceRuntime;
use crate::supervisor::RestartSupervisor;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartupReport {
    pub order: Vec<String>,
    pub elapsed: Duration,
}

/// Brings a stack up in dependency order.
///
/// Each service gets its own lifecycle task; tasks of independent services
/// run concurrently, bounded by `app.max_parallel_starts` permits held from
/// `Starting` until the first probe verdict.
pub struct StartupCoordinator {
    registry: Arc<ServiceRegistry>,
    app: AppConfig,
    runtime: Arc<dyn ServiceRuntime>,
    prober: Arc<dyn Prober>,
}

impl StartupCoordinator {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        app: AppConfig,
        runtime: Arc<dyn ServiceRuntime>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            registry,
            app,
            runtime,
            prober,
        }
    }

    /// Resolves the order and spawns every lifecycle task. A cycle is
    /// reported here, before any service is started.
    pub fn launch(&self, shutdown: &CancellationToken) -> Result<RunningStack, CoordinationError> {
        let order = DependencyGraph::build(&self.registry).resolve()?;
        let stack_token = shutdown.child_token();

        let controller = ReadinessController::from_registry(&self.registry);
        let supervisor = RestartSupervisor::new(
            self.registry.names(),
            self.app.restart.clone(),
            &stack_token,
        );
        let permits = Arc::new(Semaphore::new(self.app.max_parallel_starts.max(1)));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tracing::info!(
            services = order.len(),
            order = order.join(",").as_str(),
            max_parallel_starts = self.app.max_parallel_starts,
            "starting stack"
        );

        let mut workers = JoinSet::new();
        let mut stop_timeouts = BTreeMap::new();
        for name in &order {
            let spec = self
                .registry
                .get(name)
                .cloned()
                .ok_or_else(|| CoordinationError::UnknownService {
                    service: name.clone(),
                })?;
            let token = supervisor
                .token(name)
                .ok_or_else(|| CoordinationError::UnknownService {
                    service: name.clone(),
                })?;

            metrics().register_service(name);
            stop_timeouts.insert(
                name.clone(),
                spec.stop_timeout.unwrap_or(self.app.stop_timeout),
            );

            let worker = ServiceWorker {
                spec,
                controller: controller.clone(),
                runtime: self.runtime.clone(),
                prober: self.prober.clone(),
                supervisor: supervisor.clone(),
                permits: permits.clone(),
                start_timeout: self.app.start_timeout,
                stop_timeout: self.app.stop_timeout,
                events: events_tx.clone(),
                token,
            };
            workers.spawn(worker.run());
        }

        Ok(RunningStack {
            order,
            controller,
            supervisor,
            runtime: self.runtime.clone(),
            workers,
            events: events_rx,
            token: stack_token,
            started_at: Instant::now(),
            healthy: BTreeSet::new(),
            stop_timeouts,
        })
    }

    /// Launches the stack and waits until every service is healthy. On
    /// failure everything started so far is stopped before returning.
    pub async fn start_all(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<(RunningStack, StartupReport), CoordinationError> {
        let mut stack = self.launch(shutdown)?;
        match stack.wait_healthy().await {
            Ok(report) => Ok((stack, report)),
            Err(err) => {
                stack.shutdown().await;
                Err(err)
            }
        }
    }
}

/// Cloneable view used by the management API.
#[derive(Clone)]
pub struct StackHandle {
    pub controller: ReadinessController,
    pub supervisor: RestartSupervisor,
}

impl StackHandle {
    /// Operator stop. Returns `false` when `service` is not part of the stack.
    pub fn stop_service(&self, service: &str) -> bool {
        self.supervisor.stop_service(service)
    }
}

pub struct RunningStack {
    order: Vec<String>,
    controller: ReadinessController,
    supervisor: RestartSupervisor,
    runtime: Arc<dyn ServiceRuntime>,
    workers: JoinSet<()>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    token: CancellationToken,
    started_at: Instant,
    healthy: BTreeSet<String>,
    stop_timeouts: BTreeMap<String, Duration>,
}

impl RunningStack {
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn controller(&self) -> &ReadinessController {
        &self.controller
    }

    pub fn handle(&self) -> StackHandle {
        StackHandle {
            controller: self.controller.clone(),
            supervisor: self.supervisor.clone(),
        }
    }

    pub fn stop_service(&self, service: &str) -> bool {
        self.supervisor.stop_service(service)
    }

    /// Waits until every service is healthy at the same time. A service that
    /// crashes after its first healthy report is waited on again. The first
    /// service that gives up aborts the wait with its failure.
    pub async fn wait_healthy(&mut self) -> Result<StartupReport, CoordinationError> {
        loop {
            if self.healthy.len() == self.order.len() {
                if self.controller.stack_state().await == StackState::Healthy {
                    break;
                }
                let states = self.controller.status_snapshot().await;
                self.healthy = states
                    .services
                    .into_iter()
                    .filter(|service| service.state == ServiceState::Healthy)
                    .map(|service| service.name)
                    .collect();
                continue;
            }

            let event = tokio::select! {
                _ = self.token.cancelled() => {
                    metrics().record_stack_startup(false);
                    return Err(CoordinationError::Interrupted);
                }
                event = self.events.recv() => event,
            };

            let failure = match event {
                Some(WorkerEvent::Healthy { service }) => {
                    self.healthy.insert(service);
                    continue;
                }
                Some(WorkerEvent::Unhealthy { service }) => {
                    tracing::warn!(
                        service = service.as_str(),
                        "service terminated before the stack became healthy"
                    );
                    self.healthy.remove(&service);
                    continue;
                }
                Some(WorkerEvent::GaveUp { error, .. }) => error,
                Some(WorkerEvent::OperatorStopped { service }) => {
                    CoordinationError::OperatorStopped { service }
                }
                None => CoordinationError::Interrupted,
            };

            metrics().record_stack_startup(false);
            tracing::error!(
                service = failure.service().unwrap_or(""),
                error = %failure,
                "stack startup aborted"
            );
            return Err(failure);
        }

        let elapsed = self.started_at.elapsed();
        metrics().record_stack_startup(true);
        tracing::info!(
            services = self.order.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "all services healthy"
        );
        Ok(StartupReport {
            order: self.order.clone(),
            elapsed,
        })
    }

    /// Keeps reporting lifecycle events until `until` fires or every
    /// lifecycle task has finished.
    pub async fn supervise(&mut self, until: &CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = until.cancelled() => return,
                _ = self.token.cancelled() => return,
                event = self.events.recv() => event,
            };

            match event {
                Some(WorkerEvent::Healthy { service }) => {
                    tracing::info!(service = service.as_str(), "service healthy again");
                }
                Some(WorkerEvent::Unhealthy { service }) => {
                    tracing::warn!(service = service.as_str(), "service terminated");
                }
                Some(WorkerEvent::GaveUp { service, error }) => {
                    tracing::error!(
                        service = service.as_str(),
                        error = %error,
                        "service given up; stack degraded"
                    );
                }
                Some(WorkerEvent::OperatorStopped { service }) => {
                    tracing::info!(service = service.as_str(), "service stopped by operator");
                }
                None => {
                    tracing::warn!("no supervised services remain");
                    return;
                }
            }
        }
    }

    /// Cancels every lifecycle task, then stops running services dependents-first.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        while let Some(result) = self.workers.join_next().await {
            if let Err(err) = result {
                tracing::warn!(error = %err, "service lifecycle task ended abnormally");
            }
        }

        for service in self.order.iter().rev() {
            if !self.runtime.is_running(service).await {
                continue;
            }
            let stop_timeout = self
                .stop_timeouts
                .get(service)
                .copied()
                .unwrap_or(Duration::from_secs(10));
            match timeout(stop_timeout, self.runtime.stop(service)).await {
                Ok(Ok(())) => {
                    tracing::info!(service = service.as_str(), "service stopped");
                }
                Ok(Err(err)) => {
                    tracing::warn!(service = service.as_str(), error = %err, "failed to stop service");
                }
                Err(_) => {
                    tracing::warn!(
                        service = service.as_str(),
                        timeout_ms = stop_timeout.as_millis() as u64,
                        "service did not stop in time"
                    );
                }
            }
        }

        self.controller.stop_all("stack shutdown").await;
    }
}
