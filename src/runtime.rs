use crate::config::stack::ServiceSpec;
use crate::error::Result;
use crate::readiness::error::describe_code;
use async_trait::async_trait;
use std::fmt::{Display, Formatter};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

pub mod process;

pub use process::ProcessRuntime;

/// How a service process ended. `code` is `None` when it was killed by a signal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn with_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn signalled() -> Self {
        Self { code: None }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }

    pub fn success(self) -> bool {
        self.code == Some(0)
    }
}

impl Display for ProcessExit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&describe_code(self.code))
    }
}

/// Starts and stops the processes behind declared services.
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Launches the service. Returns once the process has been spawned.
    async fn start(&self, service: &ServiceSpec) -> Result<()>;

    /// Stops the service and waits for it to exit. Unknown services are a no-op.
    async fn stop(&self, service: &str) -> Result<()>;

    async fn is_running(&self, service: &str) -> bool;

    /// Resolves when the most recently started process for `service` exits.
    async fn wait_exit(&self, service: &str) -> ProcessExit;
}

pub type DynServiceRuntime = Arc<dyn ServiceRuntime>;

/// Sleeps for `duration`; returns `true` if `shutdown` fired first.
pub async fn sleep_with_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    if duration.is_zero() {
        return shutdown.is_cancelled();
    }
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = sleep(duration) => false,
    }
}
