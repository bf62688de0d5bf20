use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::fmt::{self as stdfmt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::field::{Field, Visit};
use tracing::Event;
use tracing::Subscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{
    self as fmt_subscriber, format::Writer, FmtContext, FormatEvent, FormatFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const APP_NAME: &str = "muster";
const DEFAULT_FILTER: &str = "muster=info,info";

/// Installs the global subscriber. Info and below go to stdout, warnings and
/// errors to stderr, one `key=value` line per event. `RUST_LOG` overrides the filter.
pub fn init_tracing() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let writer = std::io::stdout
        .with_max_level(tracing::Level::INFO)
        .or_else(std::io::stderr.with_min_level(tracing::Level::WARN));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(false)
        .with_ansi(false)
        .event_format(KeyValueFormatter { app: APP_NAME })
        .fmt_fields(fmt_subscriber::format::DefaultFields::new())
        .with_writer(writer)
        .try_init()
        .map_err(|err| crate::err!("failed to initialise tracing subscriber: {err}"))
}

struct KeyValueFormatter {
    app: &'static str,
}

impl<S, N> FormatEvent<S, N> for KeyValueFormatter
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> stdfmt::Result {
        let metadata = event.metadata();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let message = visitor
            .message
            .take()
            .unwrap_or_else(|| metadata.name().to_string());
        visitor.fields.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));

        let mut line = LogLine::default();
        line.push(
            "ts",
            &Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        line.push("level", metadata.level().as_str());
        line.push("app", self.app);
        line.push("component", metadata.target());
        if let Some(span_path) = current_span_path(ctx) {
            line.push("span", &span_path);
        }
        line.push("msg", &message);
        for (key, value) in &visitor.fields {
            line.push(key, value);
        }

        writer.write_str(&line.0)?;
        writer.write_char('\n')
    }
}

fn current_span_path<S, N>(ctx: &FmtContext<'_, S, N>) -> Option<String>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    let span = ctx.lookup_current()?;
    let names = span
        .scope()
        .from_root()
        .map(|s| s.name())
        .collect::<Vec<_>>();
    (!names.is_empty()).then(|| names.join("."))
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl FieldVisitor {
    fn record_field(&mut self, field: &Field, value: String) {
        match field.name() {
            "" => {}
            "message" => self.message = Some(value),
            name => self.fields.push((name.to_string(), value)),
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_field(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn stdfmt::Debug) {
        self.record_field(field, format!("{value:?}"));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_field(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_field(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_field(field, value.to_string());
    }
}

#[derive(Default)]
struct LogLine(String);

impl LogLine {
    fn push(&mut self, key: &str, value: &str) {
        if !self.0.is_empty() {
            self.0.push(' ');
        }
        self.0.push_str(key);
        self.0.push('=');
        if needs_quoting(value) {
            self.0.push('"');
            for ch in value.chars() {
                match ch {
                    '"' => self.0.push_str("\\\""),
                    '\\' => self.0.push_str("\\\\"),
                    '\n' => self.0.push_str("\\n"),
                    '\r' => self.0.push_str("\\r"),
                    '\t' => self.0.push_str("\\t"),
                    _ => self.0.push(ch),
                }
            }
            self.0.push('"');
        } else {
            self.0.push_str(value);
        }
    }
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\\' | '=' | '[' | ']' | '{' | '}' | ','))
}

/// Process-wide counters exported on the management `/metrics` endpoint.
#[derive(Default)]
pub struct RuntimeCounters {
    stack_startups: AtomicU64,
    stack_startup_failures: AtomicU64,
    probes: ProbeRegistry,
    restarts: RestartRegistry,
    startup: StartupRegistry,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeCountersSnapshot {
    pub stack_startups: u64,
    pub stack_startup_failures: u64,
    pub probes: Vec<ProbeCountSnapshot>,
    pub restarts: Vec<RestartCountSnapshot>,
    pub startup: Vec<StartupTimingSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeCountSnapshot {
    pub service: String,
    pub success: u64,
    pub failure: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartCountSnapshot {
    pub service: String,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupTimingSnapshot {
    pub service: String,
    pub time_to_healthy_ms: Option<u64>,
}

static RUNTIME_COUNTERS: OnceLock<RuntimeCounters> = OnceLock::new();

pub fn runtime_counters() -> &'static RuntimeCounters {
    RUNTIME_COUNTERS.get_or_init(RuntimeCounters::default)
}

impl RuntimeCounters {
    pub fn inc_stack_startup(&self, succeeded: bool) {
        if succeeded {
            self.stack_startups.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stack_startup_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn register_service(&self, service: &str) {
        self.startup.register(service);
    }

    pub fn record_probe_attempt(&self, service: &str, success: bool) {
        self.probes.record(service, success);
    }

    pub fn record_restart(&self, service: &str) {
        self.restarts.record(service);
    }

    pub fn record_time_to_healthy(&self, service: &str, elapsed: Duration) {
        self.startup.record(service, elapsed);
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        RuntimeCountersSnapshot {
            stack_startups: self.stack_startups.load(Ordering::Relaxed),
            stack_startup_failures: self.stack_startup_failures.load(Ordering::Relaxed),
            probes: self.probes.snapshot(),
            restarts: self.restarts.snapshot(),
            startup: self.startup.snapshot(),
        }
    }
}

#[derive(Default)]
struct ProbeRegistry {
    inner: Mutex<BTreeMap<String, (u64, u64)>>,
}

impl ProbeRegistry {
    fn record(&self, service: &str, success: bool) {
        let mut guard = self.inner.lock().expect("probe registry poisoned");
        let entry = guard.entry(service.to_string()).or_default();
        if success {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
    }

    fn snapshot(&self) -> Vec<ProbeCountSnapshot> {
        let guard = self.inner.lock().expect("probe registry poisoned");
        guard
            .iter()
            .map(|(service, (success, failure))| ProbeCountSnapshot {
                service: service.clone(),
                success: *success,
                failure: *failure,
            })
            .collect()
    }
}

#[derive(Default)]
struct RestartRegistry {
    inner: Mutex<BTreeMap<String, u64>>,
}

impl RestartRegistry {
    fn record(&self, service: &str) {
        let mut guard = self.inner.lock().expect("restart registry poisoned");
        *guard.entry(service.to_string()).or_insert(0) += 1;
    }

    fn snapshot(&self) -> Vec<RestartCountSnapshot> {
        let guard = self.inner.lock().expect("restart registry poisoned");
        guard
            .iter()
            .map(|(service, total)| RestartCountSnapshot {
                service: service.clone(),
                total: *total,
            })
            .collect()
    }
}

#[derive(Default)]
struct StartupRegistry {
    inner: Mutex<BTreeMap<String, Option<u64>>>,
}

impl StartupRegistry {
    fn register(&self, service: &str) {
        let mut guard = self.inner.lock().expect("startup registry poisoned");
        guard.entry(service.to_string()).or_insert(None);
    }

    fn record(&self, service: &str, elapsed: Duration) {
        let mut guard = self.inner.lock().expect("startup registry poisoned");
        let millis = std::cmp::min(elapsed.as_millis(), u128::from(u64::MAX)) as u64;
        guard.insert(service.to_string(), Some(millis));
    }

    fn snapshot(&self) -> Vec<StartupTimingSnapshot> {
        let guard = self.inner.lock().expect("startup registry poisoned");
        guard
            .iter()
            .map(|(service, millis)| StartupTimingSnapshot {
                service: service.clone(),
                time_to_healthy_ms: *millis,
            })
            .collect()
    }
}
