use crate::config::stack::{ManagementConfig, ManagementEndpointConfig};
use crate::error::{Context, Result};
use crate::metrics::{metrics as metrics_collector, render_prometheus};
use crate::readiness::{retry_after_hint_seconds, StackHandle, StackSnapshot, StackState};
use axum::body::Body;
use axum::extract::Path;
use axum::http::{
    header::{CONTENT_TYPE, RETRY_AFTER},
    HeaderValue, StatusCode,
};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Shared state handed to every management handler.
#[derive(Clone)]
pub struct ManagementState {
    pub stack: StackHandle,
    pub readiness_cache: Duration,
}

pub struct ManagementServer {
    addr: SocketAddr,
    live: Option<ManagementEndpointConfig>,
    ready: Option<ManagementEndpointConfig>,
    status: Option<ManagementEndpointConfig>,
    metrics: Option<ManagementEndpointConfig>,
    control: bool,
}

impl ManagementServer {
    pub fn build(config: &ManagementConfig) -> Result<Option<Self>> {
        let has_endpoint = config.live.is_some()
            || config.ready.is_some()
            || config.status.is_some()
            || config.metrics.is_some();
        if !has_endpoint && !config.control {
            return Ok(None);
        }

        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .with_context(|| {
                format!(
                    "invalid management listen address {}:{}",
                    config.host, config.port
                )
            })?;

        Ok(Some(Self {
            addr,
            live: config.live.clone(),
            ready: config.ready.clone(),
            status: config.status.clone(),
            metrics: config.metrics.clone(),
            control: config.control,
        }))
    }

    pub fn router(&self, state: ManagementState) -> Router {
        let mut router = Router::new();

        if let Some(endpoint) = &self.live {
            router = router.route(endpoint.path.as_str(), get(live));
        }
        if let Some(endpoint) = &self.ready {
            router = router.route(endpoint.path.as_str(), get(ready));
        }
        if let Some(endpoint) = &self.status {
            router = router.route(endpoint.path.as_str(), get(status_report));
        }
        if let Some(endpoint) = &self.metrics {
            router = router.route(endpoint.path.as_str(), get(metrics));
        }
        if self.control {
            router = router.route("/services/:name/stop", post(stop_service));
        }

        router.layer(Extension(state))
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("failed to bind management listener on {}", self.addr))
    }

    pub async fn serve(self, state: ManagementState, shutdown: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve_on(listener, state, shutdown).await
    }

    pub async fn serve_on(
        self,
        listener: TcpListener,
        state: ManagementState,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let router = self.router(state);
        let local = listener.local_addr().unwrap_or(self.addr);
        tracing::info!(addr = %local, "management server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
            })
            .await
            .context("management server exited abnormally")?;

        Ok(())
    }
}

async fn live(Extension(state): Extension<ManagementState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "services": state.stack.controller.service_count(),
        })),
    )
}

async fn ready(Extension(state): Extension<ManagementState>) -> Response {
    let snapshot = state
        .stack
        .controller
        .cached_snapshot(state.readiness_cache)
        .await;
    let payload = Json(json!({
        "state": snapshot.stack_state.as_str(),
        "services": services_payload(&snapshot),
    }));

    if snapshot.stack_state == StackState::Healthy {
        return (StatusCode::OK, payload).into_response();
    }

    let mut response = payload.into_response();
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    let retry_after = retry_after_hint_seconds(state.readiness_cache);
    if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
        response.headers_mut().insert(RETRY_AFTER, value);
    }
    response
}

async fn status_report(Extension(state): Extension<ManagementState>) -> impl IntoResponse {
    let snapshot = state
        .stack
        .controller
        .cached_snapshot(state.readiness_cache)
        .await;
    (
        StatusCode::OK,
        Json(json!({
            "stack_state": snapshot.stack_state.as_str(),
            "services": services_payload(&snapshot),
            "ts": Utc::now().to_rfc3339(),
        })),
    )
}

async fn metrics(Extension(state): Extension<ManagementState>) -> Response {
    let snapshot = state
        .stack
        .controller
        .cached_snapshot(state.readiness_cache)
        .await;
    let body = render_prometheus(&snapshot, &metrics_collector().snapshot());

    let mut response = Response::new(Body::from(body));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

async fn stop_service(
    Extension(state): Extension<ManagementState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if state.stack.stop_service(&name) {
        (
            StatusCode::ACCEPTED,
            Json(json!({ "service": name, "stopping": true })),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown service `{name}`") })),
        )
    }
}

fn services_payload(snapshot: &StackSnapshot) -> Value {
    Value::Array(
        snapshot
            .services
            .iter()
            .map(|service| {
                json!({
                    "name": service.name,
                    "state": service.state.as_str(),
                    "reason": service.reason,
                    "restarts": service.restarts,
                    "depends_on": service.dependencies,
                    "unmet": service.unmet,
                })
            })
            .collect(),
    )
}
