use serde::Deserialize;

const DEFAULT_MANAGEMENT_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone)]
pub struct ManagementConfig {
    pub host: String,
    pub port: u16,
    pub live: Option<ManagementEndpointConfig>,
    pub ready: Option<ManagementEndpointConfig>,
    pub status: Option<ManagementEndpointConfig>,
    pub metrics: Option<ManagementEndpointConfig>,
    pub control: bool,
}

#[derive(Debug, Clone)]
pub struct ManagementEndpointConfig {
    pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawManagementSection {
    #[serde(default)]
    pub(crate) host: Option<String>,
    #[serde(default)]
    pub(crate) port: Option<u16>,
    #[serde(default)]
    pub(crate) live: Option<RawManagementEndpoint>,
    #[serde(default)]
    pub(crate) ready: Option<RawManagementEndpoint>,
    #[serde(default)]
    pub(crate) status: Option<RawManagementEndpoint>,
    #[serde(default)]
    pub(crate) metrics: Option<RawManagementEndpoint>,
    #[serde(default)]
    pub(crate) health: Option<RawManagementEndpoint>,
    /// Enables `POST /services/:name/stop`.
    #[serde(default)]
    pub(crate) control: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawManagementEndpoint {
    #[serde(default)]
    pub(crate) path: Option<String>,
}

pub(crate) fn resolve_management(
    section: RawManagementSection,
    errors: &mut Vec<String>,
) -> Option<ManagementConfig> {
    let port = match section.port {
        Some(port) => port,
        None => {
            errors.push("management section requires `port` when present".to_string());
            return None;
        }
    };

    let host = section
        .host
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_MANAGEMENT_HOST.to_string());

    let live_source = section.live.or(section.health);
    let live = live_source.map(|endpoint| ManagementEndpointConfig {
        path: normalise_endpoint_path(endpoint.path, "/live"),
    });

    let ready = section.ready.map(|endpoint| ManagementEndpointConfig {
        path: normalise_endpoint_path(endpoint.path, "/ready"),
    });

    let status = section.status.map(|endpoint| ManagementEndpointConfig {
        path: normalise_endpoint_path(endpoint.path, "/status"),
    });

    let metrics = section.metrics.map(|endpoint| ManagementEndpointConfig {
        path: normalise_endpoint_path(endpoint.path, "/metrics"),
    });

    let control = section.control.unwrap_or(false);

    if live.is_none() && ready.is_none() && status.is_none() && metrics.is_none() && !control {
        tracing::debug!(
            "management section provided without endpoints; management server disabled"
        );
        return None;
    }

    Some(ManagementConfig {
        host,
        port,
        live,
        ready,
        status,
        metrics,
        control,
    })
}

fn normalise_endpoint_path(path: Option<String>, default: &str) -> String {
    let mut resolved = path
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string());

    if !resolved.starts_with('/') {
        resolved.insert(0, '/');
    }

    resolved
}
