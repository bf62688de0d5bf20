use crate::readiness::{StackSnapshot, StackState};
use crate::telemetry::{runtime_counters, RuntimeCounters};
use std::fmt::Write as _;
use std::sync::OnceLock;
use std::time::Duration;

pub use crate::telemetry::{
    ProbeCountSnapshot, RestartCountSnapshot, RuntimeCountersSnapshot, StartupTimingSnapshot,
};

/// Collector that wraps the runtime counter APIs with a single entrypoint.
pub struct MetricsCollector {
    counters: &'static RuntimeCounters,
}

impl MetricsCollector {
    fn new() -> Self {
        Self {
            counters: runtime_counters(),
        }
    }

    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
        INSTANCE.get_or_init(Self::new)
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        self.counters.snapshot()
    }

    pub fn register_service(&self, service: &str) {
        self.counters.register_service(service);
    }

    pub fn record_probe_attempt(&self, service: &str, success: bool) {
        self.counters.record_probe_attempt(service, success);
    }

    pub fn record_restart(&self, service: &str) {
        self.counters.record_restart(service);
    }

    pub fn record_time_to_healthy(&self, service: &str, elapsed: Duration) {
        self.counters.record_time_to_healthy(service, elapsed);
    }

    pub fn record_stack_startup(&self, succeeded: bool) {
        self.counters.inc_stack_startup(succeeded);
    }
}

/// Returns the shared `MetricsCollector` instance.
pub fn metrics() -> &'static MetricsCollector {
    MetricsCollector::global()
}

#[derive(Clone, Copy)]
pub struct MetricFamily {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: &'static str,
}

impl MetricFamily {
    fn header(&self, output: &mut String) {
        let _ = writeln!(output, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(output, "# TYPE {} {}", self.name, self.kind);
    }

    fn sample(&self, output: &mut String, labels: &[(&str, &str)], value: impl std::fmt::Display) {
        output.push_str(self.name);
        if !labels.is_empty() {
            output.push('{');
            for (idx, (key, val)) in labels.iter().enumerate() {
                if idx > 0 {
                    output.push(',');
                }
                let _ = write!(output, "{key}=\"{}\"", escape_label(val));
            }
            output.push('}');
        }
        let _ = writeln!(output, " {value}");
    }
}

pub const STACK_HEALTHY: MetricFamily = MetricFamily {
    name: "muster_stack_healthy",
    help: "1 when every service in the stack is healthy",
    kind: "gauge",
};

pub const SERVICE_STATE: MetricFamily = MetricFamily {
    name: "muster_service_state",
    help: "Current lifecycle state per service (1 for the active state)",
    kind: "gauge",
};

pub const SERVICE_RESTARTS: MetricFamily = MetricFamily {
    name: "muster_service_restarts_total",
    help: "Restarts scheduled by the supervisor per service",
    kind: "counter",
};

pub const PROBE_ATTEMPTS: MetricFamily = MetricFamily {
    name: "muster_probe_attempts_total",
    help: "Health probe attempts per service and outcome",
    kind: "counter",
};

pub const TIME_TO_HEALTHY: MetricFamily = MetricFamily {
    name: "muster_service_time_to_healthy_ms",
    help: "Milliseconds from start to the most recent healthy probe",
    kind: "gauge",
};

pub const STACK_STARTUPS: MetricFamily = MetricFamily {
    name: "muster_stack_startups_total",
    help: "Stack startup attempts by outcome",
    kind: "counter",
};

/// Renders the Prometheus text exposition for the management `/metrics` endpoint.
pub fn render_prometheus(stack: &StackSnapshot, counters: &RuntimeCountersSnapshot) -> String {
    let mut output = String::new();

    STACK_HEALTHY.header(&mut output);
    STACK_HEALTHY.sample(
        &mut output,
        &[],
        u8::from(stack.stack_state == StackState::Healthy),
    );

    SERVICE_STATE.header(&mut output);
    for service in &stack.services {
        SERVICE_STATE.sample(
            &mut output,
            &[("service", service.name.as_str()), ("state", service.state.as_str())],
            1,
        );
    }

    SERVICE_RESTARTS.header(&mut output);
    for restart in &counters.restarts {
        SERVICE_RESTARTS.sample(&mut output, &[("service", restart.service.as_str())], restart.total);
    }

    PROBE_ATTEMPTS.header(&mut output);
    for probe in &counters.probes {
        PROBE_ATTEMPTS.sample(
            &mut output,
            &[("service", probe.service.as_str()), ("outcome", "success")],
            probe.success,
        );
        PROBE_ATTEMPTS.sample(
            &mut output,
            &[("service", probe.service.as_str()), ("outcome", "failure")],
            probe.failure,
        );
    }

    TIME_TO_HEALTHY.header(&mut output);
    for timing in &counters.startup {
        if let Some(millis) = timing.time_to_healthy_ms {
            TIME_TO_HEALTHY.sample(&mut output, &[("service", timing.service.as_str())], millis);
        }
    }

    STACK_STARTUPS.header(&mut output);
    STACK_STARTUPS.sample(
        &mut output,
        &[("outcome", "healthy")],
        counters.stack_startups,
    );
    STACK_STARTUPS.sample(
        &mut output,
        &[("outcome", "failed")],
        counters.stack_startup_failures,
    );

    output
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
