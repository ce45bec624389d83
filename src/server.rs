//! HTTP trigger surface: `POST /rotate`, `GET /health`, `GET /info`.

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::backends::StoreKind;
use crate::config::{AuthorizationRuleSpec, Config};
use crate::error::ApiError;
use crate::health::HealthReporter;
use crate::rotation::TriggerSource;
use crate::scheduler::{BatchOutcome, BatchReport, Trigger};

/// Body of `POST /rotate`. An empty body rotates every enabled rule.
#[derive(Debug, Default, Deserialize)]
pub struct RotateRequest {
    #[serde(default)]
    pub rule_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleInfo {
    pub rule_name: String,
    pub secret_name: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_secret_name: Option<String>,
}

/// Static description of this deployment. Holds names, never values.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub schedule: String,
    pub rotation_enabled: bool,
    pub rotate_admin_access: bool,
    pub namespace: String,
    pub resource_group: String,
    pub secret_store: StoreKind,
    pub secret_store_endpoint: String,
    pub rules: Vec<RuleInfo>,
    pub endpoints: Vec<&'static str>,
}

impl ServiceInfo {
    pub fn new(config: &Config, rules: &[AuthorizationRuleSpec]) -> Self {
        Self {
            service: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            schedule: config.rotation.schedule.clone(),
            rotation_enabled: config.rotation.enabled,
            rotate_admin_access: config.rotation.rotate_admin_access,
            namespace: config.namespace.name.clone(),
            resource_group: config.namespace.resource_group.clone(),
            secret_store: config.secret_store.kind,
            secret_store_endpoint: config.secret_store_endpoint(),
            rules: rules
                .iter()
                .map(|r| RuleInfo {
                    rule_name: r.rule_name.clone(),
                    secret_name: r.secret_name.clone(),
                    enabled: r.enabled,
                    secondary_secret_name: r.secondary_secret_name.clone(),
                })
                .collect(),
            endpoints: vec!["POST /rotate", "GET /health", "GET /info"],
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub trigger: Arc<Trigger>,
    pub health: Arc<HealthReporter>,
    pub info: Arc<ServiceInfo>,
}

/// Manually trigger rotation for one rule or all enabled rules.
pub async fn rotate(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<BatchReport>), ApiError> {
    let request = parse_rotate_request(&body)?;
    let rule_name = request
        .rule_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());

    // A dropped request must not cancel the batch.
    let trigger = state.trigger.clone();
    let report = tokio::spawn(async move {
        trigger
            .run(TriggerSource::Manual, rule_name.as_deref())
            .await
    })
    .await
    .map_err(|e| ApiError::Internal(format!("rotation task failed: {}", e)))??;
    let status = match report.outcome {
        BatchOutcome::AllSucceeded | BatchOutcome::Empty => StatusCode::OK,
        BatchOutcome::Partial => StatusCode::MULTI_STATUS,
        BatchOutcome::AllFailed => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Ok((status, Json(report)))
}

fn parse_rotate_request(body: &[u8]) -> Result<RotateRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RotateRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.health.check().await;
    let status = if snapshot.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(snapshot))
}

pub async fn info(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(state.info.as_ref().clone())
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/rotate", post(rotate))
        .route("/health", get(health))
        .route("/info", get(info))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the router on `listen` until `shutdown` resolves.
pub async fn serve<F>(listen: &str, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("HTTP trigger listening on http://{}", listen);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")
}
