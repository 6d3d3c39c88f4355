//! HTTP API for health checks, status, and monitoring

use crate::config::ApiConfig;
use crate::coordination::ExecutionStats;
use crate::error::{RelayerError, RelayerResult};
use crate::relay::RelayStats;
use crate::security::LedgerStats;
use crate::service::RelayerService;
use crate::state::OrderRecord;
use crate::types::{ChainId, OrderId};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RelayerService>,
}

pub fn router(service: Arc<RelayerService>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .route("/orders/:order_id", get(get_order))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { service })
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, service: Arc<RelayerService>) -> RelayerResult<()> {
    let app = router(service);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Internal(format!("bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: state.service.uptime().as_secs(),
        started_at: state.service.started_at().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - journal reachable, every chain answering, relay not halted
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match state.service.journal() {
        Some(journal) => journal.health_check().await.is_ok(),
        None => true,
    };

    let details: Vec<ChainHealth> = state
        .service
        .chains()
        .health_check()
        .await
        .into_iter()
        .map(|(chain, head)| ChainHealth {
            chain,
            healthy: head.is_some(),
            head,
        })
        .collect();
    let chains = details.iter().all(|c| c.healthy);
    let halted = state.service.relay().halt_reason().await;

    let ready = database && chains && halted.is_none();
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(ReadinessResponse {
            ready,
            database,
            chains,
            halted,
            details,
        }),
    )
}

/// Relay, execution and ledger counters
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    let service = &state.service;
    Json(StatsResponse {
        active_orders: service.state().active_count().await,
        relay: service.relay().get_stats(),
        execution: service.engine().get_execution_stats().await,
        ledger: service.ledger().stats().await,
    })
}

async fn get_order(State(state): State<AppState>, Path(order_id): Path<String>) -> impl IntoResponse {
    let Ok(order_id) = order_id.parse::<OrderId>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(OrderResponse::Error {
                error: format!("invalid order id: {}", order_id),
            }),
        );
    };

    match state.service.state().get_order(&order_id).await {
        Some(record) => (StatusCode::OK, Json(OrderResponse::Found(Box::new(record)))),
        None => (
            StatusCode::NOT_FOUND,
            Json(OrderResponse::Error {
                error: format!("order {} not found", order_id),
            }),
        ),
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    uptime_seconds: u64,
    started_at: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    halted: Option<String>,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain: ChainId,
    healthy: bool,
    head: Option<u64>,
}

#[derive(Serialize)]
struct StatsResponse {
    active_orders: usize,
    relay: RelayStats,
    execution: ExecutionStats,
    ledger: LedgerStats,
}

#[derive(Serialize)]
#[serde(untagged)]
enum OrderResponse {
    Found(Box<OrderRecord>),
    Error { error: String },
}
