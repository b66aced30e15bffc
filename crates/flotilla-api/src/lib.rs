//! flotilla-api — REST API for Flotilla.
//!
//! Exposes the provisioning loop, the registry and the reaper over HTTP.
//! Mutations take the acting identity from the `x-flotilla-actor` header
//! and answer 403 when the access guard denies them.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/sources` | List capacity sources in evaluation order |
//! | GET | `/api/v1/sources/{name}` | Source details and its ledger entries |
//! | POST | `/api/v1/sources/{name}/provision` | Manually provision capacity |
//! | GET | `/api/v1/nodes` | List registered nodes |
//! | DELETE | `/api/v1/nodes/{id}` | Remove a node |
//! | PUT | `/api/v1/nodes/{id}/activity` | Report node activity |
//! | GET | `/api/v1/ledger` | In-flight promises per source and label |
//! | GET | `/api/v1/planned` | Outstanding planned capacity |
//! | PUT | `/api/v1/demand` | Set excess demand for a label |
//! | GET | `/api/v1/events` | Recent provisioning events |
//! | GET | `/api/v1/leaks` | Resources whose release failed |
//! | DELETE | `/api/v1/leaks/{id}` | Mark a leaked resource as cleaned up |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};

use flotilla_provision::{ClusterRegistry, DemandBoard, EventLog, ProvisionerHandle};
use flotilla_retention::Reaper;
use flotilla_state::StateStore;

/// Header carrying the acting identity for mutations.
pub const ACTOR_HEADER: &str = "x-flotilla-actor";

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub provisioner: ProvisionerHandle,
    pub registry: Arc<dyn ClusterRegistry>,
    pub reaper: Arc<Reaper>,
    pub demand: DemandBoard,
    pub events: EventLog,
    pub store: StateStore,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/sources", get(handlers::list_sources))
        .route("/sources/{name}", get(handlers::get_source))
        .route("/sources/{name}/provision", post(handlers::provision))
        .route("/nodes", get(handlers::list_nodes))
        .route("/nodes/{id}", axum::routing::delete(handlers::remove_node))
        .route("/nodes/{id}/activity", put(handlers::report_activity))
        .route("/ledger", get(handlers::get_ledger))
        .route("/planned", get(handlers::list_planned))
        .route("/demand", put(handlers::set_demand).get(handlers::get_demand))
        .route("/events", get(handlers::list_events))
        .route("/leaks", get(handlers::list_leaks))
        .route("/leaks/{id}", axum::routing::delete(handlers::resolve_leak))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
