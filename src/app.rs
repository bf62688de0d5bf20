use crate::config::{MusterConfig, StackConfig};
use crate::error::{Context, Result};
use crate::management::{ManagementServer, ManagementState};
use crate::readiness::{
    Prober, RunningStack, StackHandle, StartupCoordinator, StartupReport, SystemProber,
};
use crate::registry::ServiceRegistry;
use crate::runtime::{ProcessRuntime, ServiceRuntime};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Wires a stack file to the coordinator, the management server and OS signals.
pub struct MusterApp {
    stack: StackConfig,
    registry: Arc<ServiceRegistry>,
    management: Option<ManagementServer>,
    runtime: Arc<dyn ServiceRuntime>,
    prober: Arc<dyn Prober>,
    shutdown: CancellationToken,
}

impl MusterApp {
    pub fn initialise(config: &MusterConfig, stack_path: &Path) -> Result<Self> {
        crate::ensure_err!(
            stack_path.is_file(),
            "stack file {} does not exist",
            stack_path.display()
        );
        let mut stack = StackConfig::from_path(stack_path)
            .with_context(|| format!("failed to load stack file {}", stack_path.display()))?;
        config.apply_overrides(&mut stack);

        let runtime =
            ProcessRuntime::new(stack.app.container_cli.clone()).detached(config.detach);
        let prober = SystemProber::new().context("failed to construct probe client")?;

        Self::with_collaborators(stack, Arc::new(runtime), Arc::new(prober))
    }

    pub fn with_collaborators(
        stack: StackConfig,
        runtime: Arc<dyn ServiceRuntime>,
        prober: Arc<dyn Prober>,
    ) -> Result<Self> {
        let registry =
            ServiceRegistry::build(&stack).context("failed to construct service registry")?;

        let management = match stack.management.as_ref() {
            Some(cfg) => {
                ManagementServer::build(cfg).context("failed to construct management server")?
            }
            None => None,
        };

        Ok(Self {
            stack,
            registry: Arc::new(registry),
            management,
            runtime,
            prober,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Starts every service and returns once the stack is healthy. On failure
    /// everything already started is stopped and the first failure is returned.
    pub async fn start(self) -> Result<StartedSession> {
        let signals = spawn_signal_listener(self.shutdown.clone());

        let coordinator = StartupCoordinator::new(
            Arc::clone(&self.registry),
            self.stack.app.clone(),
            Arc::clone(&self.runtime),
            Arc::clone(&self.prober),
        );
        let mut stack = match coordinator.launch(&self.shutdown) {
            Ok(stack) => stack,
            Err(err) => {
                signals.abort();
                return Err(err.into());
            }
        };

        let management = self.management.map(|server| {
            let state = ManagementState {
                stack: stack.handle(),
                readiness_cache: self.stack.app.readiness_cache,
            };
            tokio::spawn(server.serve(state, self.shutdown.clone()))
        });

        let mut session = AppSession {
            stack,
            management,
            signals,
            shutdown: self.shutdown,
        };

        match session.stack.wait_healthy().await {
            Ok(report) => Ok(session.with_report(report)),
            Err(err) => {
                session.stop().await;
                Err(err.into())
            }
        }
    }
}

pub struct AppSession {
    stack: RunningStack,
    management: Option<JoinHandle<Result<()>>>,
    signals: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl AppSession {
    fn with_report(self, report: StartupReport) -> StartedSession {
        StartedSession {
            session: self,
            report,
        }
    }

    async fn stop(self) {
        let AppSession {
            stack,
            management,
            signals,
            shutdown,
        } = self;

        stack.shutdown().await;
        shutdown.cancel();
        signals.abort();

        if let Some(task) = management {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "management server exited with error");
                }
                Err(join_err) => {
                    tracing::warn!(error = %join_err, "management server task join error");
                }
            }
        }
    }
}

/// A stack that reached healthy. Either supervise it until shutdown or detach.
pub struct StartedSession {
    session: AppSession,
    report: StartupReport,
}

impl StartedSession {
    pub fn report(&self) -> &StartupReport {
        &self.report
    }

    pub fn handle(&self) -> StackHandle {
        self.session.stack.handle()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.session.shutdown.clone()
    }

    /// Supervises restarts until a shutdown signal, then stops every service
    /// in reverse dependency order.
    pub async fn run_until_shutdown(mut self) -> Result<()> {
        let shutdown = self.session.shutdown.clone();
        self.session.stack.supervise(&shutdown).await;
        tracing::info!("stopping stack");
        self.session.stop().await;
        Ok(())
    }

    /// Leaves services running and returns immediately.
    pub fn detach(self) {
        self.session.signals.abort();
        if let Some(task) = &self.session.management {
            task.abort();
        }
        tracing::info!(
            services = self.report.order.len(),
            "detached from running stack"
        );
    }
}

fn spawn_signal_listener(shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_signal() => {
                tracing::info!("shutdown signal received");
                shutdown.cancel();
            }
            _ = shutdown.cancelled() => {}
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
