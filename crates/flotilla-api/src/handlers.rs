//! REST API handlers.
//!
//! Reads go straight to the loop, registry or store; mutations go through
//! the provisioning loop and reaper so the access guard sees every one.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use flotilla_provision::{
    Actor, CapacitySource, ConfigError, DemandSignal, Label, LedgerEntry, MutationError,
    RegistryError,
};
use flotilla_state::epoch_secs;

use crate::{ACTOR_HEADER, ApiState};

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn mutation_error(e: MutationError) -> Response {
    let status = match &e {
        MutationError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        MutationError::UnknownSource(_) => StatusCode::NOT_FOUND,
        MutationError::Registry(RegistryError::NodeNotFound(_)) => StatusCode::NOT_FOUND,
        MutationError::UnsupportedLabel { .. } | MutationError::ZeroWorkload => {
            StatusCode::BAD_REQUEST
        }
        MutationError::Request(_) => StatusCode::BAD_GATEWAY,
        MutationError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

/// Acting identity of a request; anonymous without the header.
fn actor(headers: &HeaderMap) -> Actor {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(Actor::new)
        .unwrap_or_else(Actor::anonymous)
}

fn parse_label(raw: Option<String>) -> Result<Option<Label>, ConfigError> {
    raw.map(Label::new).transpose()
}

// ── Sources ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct SourceView {
    pub name: String,
    pub display_name: String,
    pub url: String,
}

impl SourceView {
    fn of(source: &dyn CapacitySource) -> Self {
        Self {
            name: source.name().to_string(),
            display_name: source.display_name(),
            url: source.url(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SourceDetail {
    #[serde(flatten)]
    pub source: SourceView,
    pub ledger: Vec<LedgerEntry>,
}

/// GET /api/v1/sources
pub async fn list_sources(State(state): State<ApiState>) -> Response {
    let provisioner = state.provisioner.lock().await;
    let sources: Vec<SourceView> = provisioner
        .sources()
        .iter()
        .map(|s| SourceView::of(s.as_ref()))
        .collect();
    ApiResponse::ok(sources).into_response()
}

/// GET /api/v1/sources/{name}
pub async fn get_source(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    let provisioner = state.provisioner.lock().await;
    let Some(source) = provisioner.sources().get(&name) else {
        return error_response("source not found", StatusCode::NOT_FOUND);
    };
    let ledger = provisioner
        .ledger()
        .entries()
        .into_iter()
        .filter(|e| e.source.as_str() == name)
        .collect();
    ApiResponse::ok(SourceDetail {
        source: SourceView::of(source.as_ref()),
        ledger,
    })
    .into_response()
}

/// Manual provision request body.
#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    #[serde(default)]
    pub label: Option<String>,
    pub excess: u32,
}

/// POST /api/v1/sources/{name}/provision
pub async fn provision(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ProvisionRequest>,
) -> Response {
    let label = match parse_label(req.label) {
        Ok(label) => label,
        Err(e) => return error_response(&e.to_string(), StatusCode::BAD_REQUEST),
    };
    let actor = actor(&headers);

    let mut provisioner = state.provisioner.lock().await;
    match provisioner.provision_manually(&actor, &name, label, req.excess) {
        Ok(planned) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(serde_json::json!({
                "source": name,
                "planned": planned,
            })),
        )
            .into_response(),
        Err(e) => mutation_error(e),
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> Response {
    match state.registry.list() {
        Ok(nodes) => ApiResponse::ok(nodes).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// DELETE /api/v1/nodes/{id}
pub async fn remove_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let actor = actor(&headers);
    match state.reaper.remove_node(&actor, &id, "requested via api") {
        // The release finishes in the background.
        Ok(_release) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(serde_json::json!({
                "node": id,
                "status": "removing",
            })),
        )
            .into_response(),
        Err(e) => mutation_error(e),
    }
}

/// Activity report body, sent by the job scheduler.
#[derive(Debug, Deserialize)]
pub struct ActivityReport {
    pub busy_executors: u32,
    #[serde(default)]
    pub pending_tasks: u32,
}

/// PUT /api/v1/nodes/{id}/activity
pub async fn report_activity(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(report): Json<ActivityReport>,
) -> Response {
    match state.registry.update_activity(
        &id,
        report.busy_executors,
        report.pending_tasks,
        epoch_secs(),
    ) {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(RegistryError::NodeNotFound(_)) => {
            error_response("node not found", StatusCode::NOT_FOUND)
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

// ── Provisioning status ────────────────────────────────────────

/// GET /api/v1/ledger
pub async fn get_ledger(State(state): State<ApiState>) -> Response {
    let provisioner = state.provisioner.lock().await;
    ApiResponse::ok(provisioner.ledger().entries()).into_response()
}

/// GET /api/v1/planned
pub async fn list_planned(State(state): State<ApiState>) -> Response {
    let provisioner = state.provisioner.lock().await;
    ApiResponse::ok(provisioner.outstanding()).into_response()
}

/// Demand update body. An excess of 0 clears the label.
#[derive(Debug, Deserialize)]
pub struct DemandRequest {
    #[serde(default)]
    pub label: Option<String>,
    pub excess: u32,
}

/// PUT /api/v1/demand
pub async fn set_demand(State(state): State<ApiState>, Json(req): Json<DemandRequest>) -> Response {
    let label = match parse_label(req.label) {
        Ok(label) => label,
        Err(e) => return error_response(&e.to_string(), StatusCode::BAD_REQUEST),
    };
    state.demand.set(label, req.excess);
    ApiResponse::ok(state.demand.sample()).into_response()
}

/// GET /api/v1/demand
pub async fn get_demand(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.demand.sample()).into_response()
}

/// GET /api/v1/events
pub async fn list_events(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.events.snapshot()).into_response()
}

/// GET /api/v1/leaks
pub async fn list_leaks(State(state): State<ApiState>) -> Response {
    match state.store.list_leaks() {
        Ok(leaks) => ApiResponse::ok(leaks).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// DELETE /api/v1/leaks/{id}
///
/// Acknowledge that a leaked resource has been cleaned up by hand.
pub async fn resolve_leak(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.delete_leak(&id) {
        Ok(true) => ApiResponse::ok("resolved").into_response(),
        Ok(false) => error_response("leak not found", StatusCode::NOT_FOUND),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}
