use humantime::parse_duration;
use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::time::Duration;

pub const DEFAULT_MAX_PARALLEL_STARTS: usize = 4;
pub const DEFAULT_CONTAINER_CLI: &str = "docker";

pub fn default_restart_budget() -> RestartBudget {
    RestartBudget {
        max_restarts: Some(5),
        window: Duration::from_secs(300),
        base_backoff: Duration::from_secs(1),
        max_backoff: Duration::from_secs(30),
        jitter: JitterMode::Full,
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub max_parallel_starts: usize,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub readiness_cache: Duration,
    pub container_cli: String,
    pub restart: RestartBudget,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_parallel_starts: DEFAULT_MAX_PARALLEL_STARTS,
            start_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(10),
            readiness_cache: Duration::from_millis(250),
            container_cli: DEFAULT_CONTAINER_CLI.to_string(),
            restart: default_restart_budget(),
        }
    }
}

/// Rate limit applied to restarts of a single service.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartBudget {
    /// `None` lets a service restart forever (still subject to backoff).
    pub max_restarts: Option<u32>,
    pub window: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: JitterMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterMode {
    None,
    Equal,
    Full,
}

impl JitterMode {
    pub fn as_str(self) -> &'static str {
        match self {
            JitterMode::None => "none",
            JitterMode::Equal => "equal",
            JitterMode::Full => "full",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawAppSection {
    #[serde(default)]
    pub(crate) max_parallel_starts: Option<usize>,
    #[serde(default)]
    pub(crate) start_timeout: Option<String>,
    #[serde(default)]
    pub(crate) stop_timeout: Option<String>,
    #[serde(default)]
    pub(crate) readiness_cache: Option<String>,
    #[serde(default)]
    pub(crate) container_cli: Option<String>,
    #[serde(default)]
    pub(crate) restart: Option<RawRestartBudget>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawRestartBudget {
    #[serde(default)]
    pub(crate) max_restarts: Option<YamlValue>,
    #[serde(default)]
    pub(crate) window: Option<String>,
    #[serde(default)]
    pub(crate) base_backoff: Option<String>,
    #[serde(default)]
    pub(crate) max_backoff: Option<String>,
    #[serde(default)]
    pub(crate) jitter: Option<String>,
}

pub(crate) fn parse_app_config(raw: Option<RawAppSection>, errors: &mut Vec<String>) -> AppConfig {
    let raw = raw.unwrap_or_default();
    let mut config = AppConfig::default();

    if let Some(value) = raw.max_parallel_starts {
        if value == 0 {
            errors.push("app.max_parallel_starts must be greater than zero".to_string());
        } else {
            config.max_parallel_starts = value;
        }
    }

    if let Some(duration) =
        parse_duration_value("app.start_timeout", raw.start_timeout, errors)
            .and_then(|dur| ensure_positive_duration(dur, "app.start_timeout", errors))
    {
        config.start_timeout = duration;
    }

    if let Some(duration) = parse_duration_value("app.stop_timeout", raw.stop_timeout, errors)
        .and_then(|dur| ensure_positive_duration(dur, "app.stop_timeout", errors))
    {
        config.stop_timeout = duration;
    }

    if let Some(duration) =
        parse_duration_value("app.readiness_cache", raw.readiness_cache, errors)
    {
        if duration < Duration::from_millis(50) {
            errors.push("app.readiness_cache must be at least 50ms".to_string());
        } else {
            config.readiness_cache = duration;
        }
    }

    if let Some(cli) = raw.container_cli {
        let trimmed = cli.trim();
        if trimmed.is_empty() {
            errors.push("app.container_cli must be a non-empty string".to_string());
        } else {
            config.container_cli = trimmed.to_string();
        }
    }

    if let Some(restart) = raw.restart {
        config.restart = parse_restart_budget(restart, errors);
    }

    config
}

fn parse_restart_budget(raw: RawRestartBudget, errors: &mut Vec<String>) -> RestartBudget {
    let mut budget = default_restart_budget();

    if let Some(value) = raw.max_restarts {
        match parse_max_restarts(value) {
            Ok(parsed) => budget.max_restarts = parsed,
            Err(message) => errors.push(message),
        }
    }

    if let Some(duration) = parse_duration_value("app.restart.window", raw.window, errors)
        .and_then(|dur| ensure_positive_duration(dur, "app.restart.window", errors))
    {
        budget.window = duration;
    }

    if let Some(duration) =
        parse_duration_value("app.restart.base_backoff", raw.base_backoff, errors)
    {
        budget.base_backoff = duration;
    }

    if let Some(duration) = parse_duration_value("app.restart.max_backoff", raw.max_backoff, errors)
        .and_then(|dur| ensure_positive_duration(dur, "app.restart.max_backoff", errors))
    {
        budget.max_backoff = duration;
    }

    if budget.base_backoff > budget.max_backoff {
        errors.push(format!(
            "app.restart.base_backoff ({}) must not exceed app.restart.max_backoff ({})",
            humantime::format_duration(budget.base_backoff),
            humantime::format_duration(budget.max_backoff)
        ));
    }

    if let Some(jitter_raw) = raw.jitter {
        let trimmed = jitter_raw.trim();
        match parse_jitter_mode(trimmed) {
            Some(mode) => budget.jitter = mode,
            None => errors.push(format!(
                "app.restart.jitter must be one of `none`, `equal`, or `full` (got `{trimmed}`)"
            )),
        }
    }

    budget
}

fn parse_max_restarts(value: YamlValue) -> Result<Option<u32>, String> {
    match value {
        YamlValue::String(text) => {
            let trimmed = text.trim();
            if trimmed.eq_ignore_ascii_case("unlimited") {
                Ok(None)
            } else {
                trimmed.parse::<u32>().map(Some).map_err(|_| {
                    format!(
                        "app.restart.max_restarts must be `unlimited` or a non-negative integer (got `{trimmed}`)"
                    )
                })
            }
        }
        YamlValue::Number(number) => number
            .as_u64()
            .and_then(|value| u32::try_from(value).ok())
            .map(Some)
            .ok_or_else(|| {
                format!(
                    "app.restart.max_restarts must be `unlimited` or a non-negative integer (got `{number}`)"
                )
            }),
        YamlValue::Null => Ok(None),
        other => Err(format!(
            "app.restart.max_restarts must be `unlimited` or a non-negative integer (got `{}`)",
            value_to_string(&other)
        )),
    }
}

fn parse_jitter_mode(value: &str) -> Option<JitterMode> {
    match value.to_ascii_lowercase().as_str() {
        "none" => Some(JitterMode::None),
        "equal" => Some(JitterMode::Equal),
        "full" => Some(JitterMode::Full),
        _ => None,
    }
}

pub(crate) fn parse_duration_value(
    field_label: &str,
    raw: Option<String>,
    errors: &mut Vec<String>,
) -> Option<Duration> {
    let raw = raw?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        errors.push(format!("{field_label} must be a non-empty duration"));
        return None;
    }

    match parse_duration(trimmed) {
        Ok(duration) => Some(duration),
        Err(_) => {
            errors.push(format!(
                "{field_label} must be a valid duration (got `{trimmed}`)"
            ));
            None
        }
    }
}

pub(crate) fn ensure_positive_duration(
    duration: Duration,
    label: &str,
    errors: &mut Vec<String>,
) -> Option<Duration> {
    if duration.is_zero() {
        errors.push(format!("{label} must be greater than zero"));
        None
    } else {
        Some(duration)
    }
}

pub(crate) fn value_to_string(value: &YamlValue) -> String {
    match value {
        YamlValue::Null => "null".to_string(),
        YamlValue::Bool(inner) => inner.to_string(),
        YamlValue::Number(inner) => inner.to_string(),
        YamlValue::String(inner) => inner.clone(),
        YamlValue::Sequence(items) => format!(
            "[{}]",
            items
                .iter()
                .map(value_to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ),
        YamlValue::Mapping(map) => format!(
            "{{{}}}",
            map.iter()
                .map(|(key, val)| format!("{}: {}", value_to_string(key), value_to_string(val)))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        YamlValue::Tagged(tagged) => value_to_string(&tagged.value),
    }
}
