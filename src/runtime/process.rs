use super::{ProcessExit, ServiceRuntime};
use crate::config::stack::{Launch, ServiceSpec, DEFAULT_CONTAINER_CLI};
use crate::error::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

/// Runs services as local child processes.
///
/// `command` services run under `sh -c`; `image` services run through the
/// configured container CLI (`<cli> run --rm --name muster-<service> <image>`).
pub struct ProcessRuntime {
    container_cli: String,
    detached: bool,
    processes: Mutex<HashMap<String, ProcessHandle>>,
}

#[derive(Clone)]
struct ProcessHandle {
    kill: CancellationToken,
    exit: watch::Receiver<Option<ProcessExit>>,
    container: Option<String>,
}

impl ProcessHandle {
    fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new(DEFAULT_CONTAINER_CLI)
    }
}

impl ProcessRuntime {
    pub fn new(container_cli: impl Into<String>) -> Self {
        Self {
            container_cli: container_cli.into(),
            detached: false,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Leaves children running when muster itself exits.
    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    fn command_for(&self, spec: &ServiceSpec) -> (Command, Option<String>) {
        let (mut command, container) = match &spec.launch {
            Launch::Command(line) => {
                let mut command = std::process::Command::new("sh");
                command.arg("-c").arg(line).envs(&spec.environment);
                if let Some(dir) = &spec.working_dir {
                    command.current_dir(dir);
                }
                (command, None)
            }
            Launch::Image(image) => {
                let container = container_name(&spec.name);
                let mut command = std::process::Command::new(&self.container_cli);
                command.args(["run", "--rm", "--name", container.as_str()]);
                for (key, value) in &spec.environment {
                    command.arg("-e").arg(format!("{key}={value}"));
                }
                command.arg(image);
                (command, Some(container))
            }
        };

        // Each service leads its own process group so stop reaches every
        // process the shell forked.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        (Command::from(command), container)
    }

    async fn handle(&self, service: &str) -> Option<ProcessHandle> {
        self.processes.lock().await.get(service).cloned()
    }
}

#[async_trait]
impl ServiceRuntime for ProcessRuntime {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn start(&self, spec: &ServiceSpec) -> Result<()> {
        let mut processes = self.processes.lock().await;
        if processes
            .get(&spec.name)
            .is_some_and(ProcessHandle::is_running)
        {
            crate::bail_err!("service `{}` is already running", spec.name);
        }

        let (mut command, container) = self.command_for(spec);
        command.stdin(Stdio::null()).kill_on_drop(!self.detached);

        let mut child = command.spawn().with_context(|| {
            format!(
                "failed to spawn {} `{}` for service `{}`",
                spec.launch.kind(),
                spec.launch.target(),
                spec.name
            )
        })?;

        tracing::debug!(
            service = spec.name.as_str(),
            launch = spec.launch.kind(),
            pid = child.id().unwrap_or_default(),
            "service process spawned"
        );

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let kill_signal = kill.clone();
        let service = spec.name.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_signal.cancelled() => {
                    kill_process_group(&mut child, &service);
                    child.wait().await
                }
            };

            let exit = match status {
                Ok(status) => ProcessExit::from_status(status),
                Err(err) => {
                    tracing::warn!(service = service.as_str(), error = %err, "failed to reap service process");
                    ProcessExit::signalled()
                }
            };
            tracing::debug!(service = service.as_str(), exit = %exit, "service process exited");
            exit_tx.send_replace(Some(exit));
        });

        processes.insert(
            spec.name.clone(),
            ProcessHandle {
                kill,
                exit: exit_rx,
                container,
            },
        );
        Ok(())
    }

    async fn stop(&self, service: &str) -> Result<()> {
        let Some(mut handle) = self.handle(service).await else {
            return Ok(());
        };
        if !handle.is_running() {
            return Ok(());
        }

        if let Some(container) = &handle.container {
            let status = Command::new(&self.container_cli)
                .args(["stop", container.as_str()])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(err) = status {
                tracing::warn!(service = service, error = %err, "container stop command failed");
            }
        }

        handle.kill.cancel();
        // The reaper task owns the sender; a closed channel means it has exited.
        let _ = handle.exit.wait_for(Option::is_some).await;
        Ok(())
    }

    async fn is_running(&self, service: &str) -> bool {
        self.handle(service)
            .await
            .is_some_and(|handle| handle.is_running())
    }

    async fn wait_exit(&self, service: &str) -> ProcessExit {
        let Some(mut handle) = self.handle(service).await else {
            return ProcessExit::signalled();
        };

        let exit = match handle.exit.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or_else(ProcessExit::signalled),
            Err(_) => ProcessExit::signalled(),
        };
        exit
    }
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child, service: &str) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => return,
            Err(err) => {
                tracing::warn!(service = service, error = %err, "failed to signal service process group");
            }
        }
    }
    if let Err(err) = child.start_kill() {
        tracing::warn!(service = service, error = %err, "failed to signal service process");
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child, service: &str) {
    if let Err(err) = child.start_kill() {
        tracing::warn!(service = service, error = %err, "failed to signal service process");
    }
}

fn container_name(service: &str) -> String {
    format!("muster-{service}")
}
