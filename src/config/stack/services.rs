use super::app::{ensure_positive_duration, parse_duration_value, value_to_string};
use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PROBE_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    pub launch: Launch,
    pub working_dir: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
    pub probe: Option<ProbeSpec>,
    pub depends_on: Vec<Dependency>,
    pub restart: RestartPolicy,
    pub stop_timeout: Option<Duration>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, launch: Launch) -> Self {
        Self {
            name: name.into(),
            launch,
            working_dir: None,
            environment: BTreeMap::new(),
            probe: None,
            depends_on: Vec::new(),
            restart: RestartPolicy::default(),
            stop_timeout: None,
        }
    }

    pub fn with_dependency(mut self, name: impl Into<String>, condition: DependencyCondition) -> Self {
        self.depends_on.push(Dependency {
            name: name.into(),
            condition,
        });
        self
    }

    pub fn with_probe(mut self, probe: ProbeSpec) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.depends_on.iter().map(|dep| dep.name.as_str())
    }
}

/// How the runtime brings a service up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launch {
    Command(String),
    Image(String),
}

impl Launch {
    pub fn kind(&self) -> &'static str {
        match self {
            Launch::Command(_) => "command",
            Launch::Image(_) => "image",
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Launch::Command(command) => command,
            Launch::Image(image) => image,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSpec {
    pub check: ProbeCheck,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

impl ProbeSpec {
    pub fn new(check: ProbeCheck) -> Self {
        Self {
            check,
            interval: DEFAULT_PROBE_INTERVAL,
            timeout: DEFAULT_PROBE_TIMEOUT,
            retries: DEFAULT_PROBE_RETRIES,
            start_period: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeCheck {
    /// Shell command; exit status 0 means healthy.
    Command(String),
    /// `GET` request; healthy on `expected_status`, or any 2xx when unset.
    Http {
        url: String,
        expected_status: Option<u16>,
    },
    /// Healthy once a TCP connection is accepted.
    Tcp { address: String },
}

impl ProbeCheck {
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeCheck::Command(_) => "command",
            ProbeCheck::Http { .. } => "http",
            ProbeCheck::Tcp { .. } => "tcp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub condition: DependencyCondition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyCondition {
    Healthy,
    Started,
}

impl DependencyCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            DependencyCondition::Healthy => "healthy",
            DependencyCondition::Started => "started",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "healthy" | "service_healthy" => Some(DependencyCondition::Healthy),
            "started" | "service_started" => Some(DependencyCondition::Started),
            _ => None,
        }
    }
}

impl fmt::Display for DependencyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    Always,
    UnlessStopped,
    OnFailure,
    #[default]
    Never,
}

impl RestartPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RestartPolicy::Always => "always",
            RestartPolicy::UnlessStopped => "unless-stopped",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::Never => "never",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "always" => Some(RestartPolicy::Always),
            "unless-stopped" | "unless_stopped" => Some(RestartPolicy::UnlessStopped),
            "on-failure" | "on_failure" => Some(RestartPolicy::OnFailure),
            "never" | "no" => Some(RestartPolicy::Never),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawService {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    environment: BTreeMap<String, YamlValue>,
    #[serde(default)]
    probe: Option<RawProbe>,
    #[serde(default)]
    depends_on: Vec<RawDependency>,
    #[serde(default)]
    restart: Option<String>,
    #[serde(default)]
    stop_timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDependency {
    Name(String),
    Detailed(RawDependencyDetail),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDependencyDetail {
    name: String,
    #[serde(default)]
    condition: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProbe {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    http: Option<String>,
    #[serde(default)]
    tcp: Option<String>,
    #[serde(default)]
    expected_status: Option<u16>,
    #[serde(default)]
    interval: Option<String>,
    #[serde(default)]
    timeout: Option<String>,
    #[serde(default)]
    retries: Option<u32>,
    #[serde(default)]
    start_period: Option<String>,
}

pub(crate) fn parse_services(raw: Vec<RawService>, errors: &mut Vec<String>) -> Vec<ServiceSpec> {
    let mut seen = HashSet::new();
    let mut services = Vec::with_capacity(raw.len());

    for (index, raw_service) in raw.into_iter().enumerate() {
        let Some(name) = raw_service
            .name
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
        else {
            errors.push(format!("services[{index}]: `name` is required"));
            continue;
        };

        if !seen.insert(name.clone()) {
            errors.push(format!("service `{name}` is declared more than once"));
            continue;
        }

        if let Some(service) = parse_service(name, raw_service, errors) {
            services.push(service);
        }
    }

    services
}

fn parse_service(name: String, raw: RawService, errors: &mut Vec<String>) -> Option<ServiceSpec> {
    let command = non_empty(raw.command);
    let image = non_empty(raw.image);
    let launch = match (command, image) {
        (Some(command), None) => Some(Launch::Command(command)),
        (None, Some(image)) => Some(Launch::Image(image)),
        (Some(_), Some(_)) => {
            errors.push(format!(
                "service `{name}` must set exactly one of `command` or `image` (got both)"
            ));
            None
        }
        (None, None) => {
            errors.push(format!(
                "service `{name}` must set exactly one of `command` or `image`"
            ));
            None
        }
    };

    let environment = raw
        .environment
        .into_iter()
        .filter_map(|(key, value)| match value {
            YamlValue::Sequence(_) | YamlValue::Mapping(_) => {
                errors.push(format!(
                    "service `{name}` environment `{key}` must be a scalar value"
                ));
                None
            }
            other => Some((key, value_to_string(&other))),
        })
        .collect();

    let probe = raw
        .probe
        .and_then(|probe| parse_probe(&name, probe, errors));

    let depends_on = parse_dependencies(&name, raw.depends_on, errors);

    let restart = match raw.restart {
        None => RestartPolicy::default(),
        Some(value) => {
            let trimmed = value.trim();
            RestartPolicy::parse(trimmed).unwrap_or_else(|| {
                errors.push(format!(
                    "service `{name}` restart must be one of `always`, `unless-stopped`, `on-failure`, or `never` (got `{trimmed}`)"
                ));
                RestartPolicy::default()
            })
        }
    };

    let stop_label = format!("service `{name}` stop_timeout");
    let stop_timeout = parse_duration_value(&stop_label, raw.stop_timeout, errors)
        .and_then(|duration| ensure_positive_duration(duration, &stop_label, errors));

    Some(ServiceSpec {
        launch: launch?,
        working_dir: non_empty(raw.working_dir).map(PathBuf::from),
        environment,
        probe,
        depends_on,
        restart,
        stop_timeout,
        name,
    })
}

fn parse_dependencies(
    service: &str,
    raw: Vec<RawDependency>,
    errors: &mut Vec<String>,
) -> Vec<Dependency> {
    let mut seen = BTreeSet::new();
    let mut dependencies = Vec::with_capacity(raw.len());

    for entry in raw {
        let (name, condition) = match entry {
            RawDependency::Name(name) => (name, None),
            RawDependency::Detailed(detail) => (detail.name, detail.condition),
        };

        let name = name.trim().to_string();
        if name.is_empty() {
            errors.push(format!(
                "service `{service}` depends_on entries must name a service"
            ));
            continue;
        }

        let condition = match condition {
            None => DependencyCondition::Healthy,
            Some(value) => {
                let trimmed = value.trim();
                match DependencyCondition::parse(trimmed) {
                    Some(condition) => condition,
                    None => {
                        errors.push(format!(
                            "service `{service}` dependency `{name}` condition must be `healthy` or `started` (got `{trimmed}`)"
                        ));
                        continue;
                    }
                }
            }
        };

        if !seen.insert(name.clone()) {
            errors.push(format!(
                "service `{service}` lists dependency `{name}` more than once"
            ));
            continue;
        }

        dependencies.push(Dependency { name, condition });
    }

    dependencies
}

fn parse_probe(service: &str, raw: RawProbe, errors: &mut Vec<String>) -> Option<ProbeSpec> {
    let label = format!("service `{service}` probe");
    let command = non_empty(raw.command);
    let http = non_empty(raw.http);
    let tcp = non_empty(raw.tcp);

    let configured = [command.is_some(), http.is_some(), tcp.is_some()]
        .into_iter()
        .filter(|set| *set)
        .count();
    if configured != 1 {
        errors.push(format!(
            "{label} must set exactly one of `command`, `http`, or `tcp`"
        ));
        return None;
    }

    if raw.expected_status.is_some() && http.is_none() {
        errors.push(format!(
            "{label} `expected_status` only applies to `http` probes"
        ));
    }

    let check = if let Some(command) = command {
        ProbeCheck::Command(command)
    } else if let Some(url) = http {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(format!(
                "{label} http must be an absolute http(s) URL (got `{url}`)"
            ));
        }
        if let Some(status) = raw.expected_status {
            if !(100..=599).contains(&status) {
                errors.push(format!(
                    "{label} expected_status must be a valid HTTP status code (got `{status}`)"
                ));
            }
        }
        ProbeCheck::Http {
            url,
            expected_status: raw.expected_status,
        }
    } else {
        let address = tcp.unwrap_or_default();
        if !address.contains(':') {
            errors.push(format!(
                "{label} tcp must be a `host:port` address (got `{address}`)"
            ));
        }
        ProbeCheck::Tcp { address }
    };

    let mut probe = ProbeSpec::new(check);

    let interval_label = format!("{label} interval");
    if let Some(interval) = parse_duration_value(&interval_label, raw.interval, errors)
        .and_then(|duration| ensure_positive_duration(duration, &interval_label, errors))
    {
        probe.interval = interval;
    }

    let timeout_label = format!("{label} timeout");
    if let Some(timeout) = parse_duration_value(&timeout_label, raw.timeout, errors)
        .and_then(|duration| ensure_positive_duration(duration, &timeout_label, errors))
    {
        probe.timeout = timeout;
    }

    if let Some(start_period) =
        parse_duration_value(&format!("{label} start_period"), raw.start_period, errors)
    {
        probe.start_period = start_period;
    }

    match raw.retries {
        Some(0) => errors.push(format!("{label} retries must be at least 1")),
        Some(retries) => probe.retries = retries,
        None => {}
    }

    Some(probe)
}

pub(crate) fn validate_dependencies(services: &[ServiceSpec], errors: &mut Vec<String>) {
    let known = services
        .iter()
        .map(|service| service.name.as_str())
        .collect::<HashSet<_>>();

    for service in services {
        for dependency in &service.depends_on {
            if dependency.name == service.name {
                errors.push(format!("service `{}` cannot depend on itself", service.name));
            } else if !known.contains(dependency.name.as_str()) {
                errors.push(format!(
                    "service `{}` depends on unknown service `{}`",
                    service.name, dependency.name
                ));
            }
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
