use crate::config::stack::{ProbeCheck, ProbeSpec};
use crate::error::Result;
use crate::metrics::metrics;
use crate::runtime::sleep_with_shutdown;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("probe command exited with {0}")]
    CommandFailed(String),
    #[error("unexpected HTTP status {status}")]
    UnexpectedStatus { status: u16 },
    #[error("request failed: {0}")]
    Request(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("probe timed out after {}", humantime::format_duration(*.after))]
    TimedOut { after: Duration },
}

/// Runs a single health check attempt.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn check(&self, service: &str, check: &ProbeCheck) -> std::result::Result<(), ProbeError>;
}

/// Checks against the real system: shell commands, HTTP endpoints, TCP ports.
#[derive(Clone)]
pub struct SystemProber {
    client: reqwest::Client,
}

impl SystemProber {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("muster/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for SystemProber {
    async fn check(&self, service: &str, check: &ProbeCheck) -> std::result::Result<(), ProbeError> {
        match check {
            ProbeCheck::Command(line) => {
                let status = Command::new("sh")
                    .arg("-c")
                    .arg(line)
                    .env("MUSTER_SERVICE", service)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .status()
                    .await
                    .map_err(|err| ProbeError::CommandFailed(err.to_string()))?;
                if status.success() {
                    Ok(())
                } else {
                    Err(ProbeError::CommandFailed(
                        crate::runtime::ProcessExit::from_status(status).to_string(),
                    ))
                }
            }
            ProbeCheck::Http {
                url,
                expected_status,
            } => {
                let response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|err| ProbeError::Request(err.to_string()))?;
                let status = response.status();
                let healthy = match expected_status {
                    Some(expected) => status.as_u16() == *expected,
                    None => status.is_success(),
                };
                if healthy {
                    Ok(())
                } else {
                    Err(ProbeError::UnexpectedStatus {
                        status: status.as_u16(),
                    })
                }
            }
            ProbeCheck::Tcp { address } => TcpStream::connect(address.as_str())
                .await
                .map(|_| ())
                .map_err(|err| ProbeError::Connect(err.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy { attempts: u32 },
    Failed { attempts: u32, last_error: ProbeError },
    Cancelled { attempts: u32 },
}

/// Drives one probe to a verdict: waits `start_period`, then makes at most
/// `retries` attempts, each bounded by `timeout` and separated by `interval`.
/// No interval is slept after the final attempt.
pub struct ProbeRunner<'a> {
    service: &'a str,
    spec: &'a ProbeSpec,
    prober: &'a dyn Prober,
}

impl<'a> ProbeRunner<'a> {
    pub fn new(service: &'a str, spec: &'a ProbeSpec, prober: &'a dyn Prober) -> Self {
        Self {
            service,
            spec,
            prober,
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> ProbeOutcome {
        if sleep_with_shutdown(self.spec.start_period, cancel).await {
            return ProbeOutcome::Cancelled { attempts: 0 };
        }

        let retries = self.spec.retries.max(1);
        let mut last_error = ProbeError::TimedOut {
            after: self.spec.timeout,
        };

        for attempt in 1..=retries {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return ProbeOutcome::Cancelled { attempts: attempt - 1 };
                }
                result = timeout(self.spec.timeout, self.prober.check(self.service, &self.spec.check)) => result,
            };

            match result {
                Ok(Ok(())) => {
                    metrics().record_probe_attempt(self.service, true);
                    tracing::debug!(
                        service = self.service,
                        probe = self.spec.check.kind(),
                        attempt,
                        "health probe passed"
                    );
                    return ProbeOutcome::Healthy { attempts: attempt };
                }
                Ok(Err(err)) => last_error = err,
                Err(_) => {
                    last_error = ProbeError::TimedOut {
                        after: self.spec.timeout,
                    }
                }
            }

            metrics().record_probe_attempt(self.service, false);
            tracing::debug!(
                service = self.service,
                probe = self.spec.check.kind(),
                attempt,
                retries,
                error = %last_error,
                "health probe attempt failed"
            );

            if attempt < retries && sleep_with_shutdown(self.spec.interval, cancel).await {
                return ProbeOutcome::Cancelled { attempts: attempt };
            }
        }

        ProbeOutcome::Failed {
            attempts: retries,
            last_error,
        }
    }
}
