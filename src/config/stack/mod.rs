mod app;
mod management;
mod services;

use serde::de::Error as _;
use serde::Deserialize;
use serde_yaml::{self, Value as YamlValue};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

pub use app::{
    default_restart_budget, AppConfig, JitterMode, RestartBudget, DEFAULT_CONTAINER_CLI,
    DEFAULT_MAX_PARALLEL_STARTS,
};
pub use management::{ManagementConfig, ManagementEndpointConfig};
pub use services::{
    Dependency, DependencyCondition, Launch, ProbeCheck, ProbeSpec, RestartPolicy, ServiceSpec,
    DEFAULT_PROBE_INTERVAL, DEFAULT_PROBE_RETRIES, DEFAULT_PROBE_TIMEOUT,
};

/// Parsed and validated stack file.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub api_version: ApiVersion,
    pub app: AppConfig,
    pub services: Vec<ServiceSpec>,
    pub management: Option<ManagementConfig>,
}

const TOP_LEVEL_FIELDS: &str = "api_version, app, services, management";

impl StackConfig {
    pub fn from_reader(mut reader: impl Read) -> Result<Self, StackConfigError> {
        let mut contents = String::new();
        reader.read_to_string(&mut contents)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, StackConfigError> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    fn from_yaml_str(contents: &str) -> Result<Self, StackConfigError> {
        let mut documents = serde_yaml::Deserializer::from_str(contents);
        let mut parsed = None;
        let mut extra_errors = Vec::new();

        for (index, document) in documents.by_ref().enumerate() {
            if index == 0 {
                parsed = Some(RawStackFile::deserialize(document)?);
            } else {
                let _: YamlValue = YamlValue::deserialize(document)?;
                extra_errors
                    .push("error[root]: multiple YAML documents are not supported".to_string());
                break;
            }
        }

        let Some(raw) = parsed else {
            let err = serde_yaml::Error::custom("stack file must contain exactly one YAML document");
            return Err(StackConfigError::Parse(err));
        };

        Self::from_raw(raw, extra_errors).map_err(StackConfigError::Invalid)
    }

    fn from_raw(raw: RawStackFile, mut errors: Vec<String>) -> Result<Self, StackValidationError> {
        let RawStackFile {
            api_version: raw_api_version,
            app: raw_app,
            services: raw_services,
            management: raw_management,
            extra_fields,
        } = raw;

        for key in extra_fields.keys() {
            errors.push(format!(
                "error[root]: unknown top-level key \"{key}\" (expected one of {TOP_LEVEL_FIELDS})"
            ));
        }

        let api_version = parse_api_version(raw_api_version, &mut errors);
        let app = app::parse_app_config(raw_app, &mut errors);
        let services = services::parse_services(raw_services, &mut errors);
        let management =
            raw_management.and_then(|section| management::resolve_management(section, &mut errors));

        services::validate_dependencies(&services, &mut errors);

        if errors.is_empty() {
            Ok(Self {
                api_version,
                app,
                services,
                management,
            })
        } else {
            Err(StackValidationError::new(errors))
        }
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|service| service.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ApiVersion {
    #[default]
    V1,
}

fn parse_api_version(raw: Option<String>, errors: &mut Vec<String>) -> ApiVersion {
    match raw {
        None => {
            errors
                .push("error[root]: api_version is required (supported versions: v1)".to_string());
        }
        Some(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                errors.push("api_version must be a non-empty string".to_string());
            } else if !trimmed.eq_ignore_ascii_case("v1") {
                errors.push(format!(
                    "api_version `{trimmed}` is not supported (supported versions: v1)"
                ));
            }
        }
    }
    ApiVersion::V1
}

#[derive(Debug, Deserialize)]
struct RawStackFile {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    app: Option<app::RawAppSection>,
    #[serde(default)]
    services: Vec<services::RawService>,
    #[serde(default)]
    management: Option<management::RawManagementSection>,
    #[serde(default)]
    #[serde(flatten)]
    extra_fields: BTreeMap<String, YamlValue>,
}

#[derive(Debug, Error)]
pub enum StackConfigError {
    #[error("failed to read stack file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse stack file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Invalid(StackValidationError),
}

#[derive(Debug, Error)]
#[error("stack file validation failed:\n{rendered}")]
pub struct StackValidationError {
    messages: Vec<String>,
    rendered: String,
}

impl StackValidationError {
    pub fn new(messages: Vec<String>) -> Self {
        let rendered = messages
            .iter()
            .map(|msg| format!("- {msg}"))
            .collect::<Vec<_>>()
            .join("\n");
        Self { messages, rendered }
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }
}
