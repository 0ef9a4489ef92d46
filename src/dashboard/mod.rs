use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::repository::{PartitionKind, Repository};
use crate::scheduler::OperationPool;

#[derive(Clone)]
pub struct DashboardState {
    pub repo: Arc<dyn Repository>,
    pub controller_partition: watch::Receiver<String>,
    pub worker_partition: Option<watch::Receiver<String>>,
    pub operations: Arc<OperationPool>,
}

#[derive(Serialize)]
struct PartitionsResponse {
    controller_partition_id: String,
    worker_partition_id: Option<String>,
}

#[derive(Serialize)]
struct TenantResponse {
    id: Uuid,
    name: String,
    scheduling: bool,
    last_scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/partitions", get(partitions_handler))
        .route("/api/tenants", get(tenants_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, token: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    let shutdown = async move { token.cancelled().await };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn partitions_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(PartitionsResponse {
        controller_partition_id: state.controller_partition.borrow().clone(),
        worker_partition_id: state.worker_partition.as_ref().map(|rx| rx.borrow().clone()),
    })
}

/// Tenants owned by this node's controller partition, with the state of
/// their scheduling loop.
async fn tenants_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let partition_id = state.controller_partition.borrow().clone();
    let tenants = match state
        .repo
        .list_tenants_by_partition(PartitionKind::Controller, &partition_id)
        .await
    {
        Ok(tenants) => tenants,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    let body: Vec<TenantResponse> = tenants
        .into_iter()
        .map(|tenant| {
            let op = state.operations.get(tenant.id);
            TenantResponse {
                id: tenant.id,
                name: tenant.name,
                scheduling: op.as_ref().is_some_and(|op| op.is_running()),
                last_scheduled_at: op.and_then(|op| op.last_run()),
            }
        })
        .collect();

    Json(body).into_response()
}
