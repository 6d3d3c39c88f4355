//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connectivity and heads
//! - Ingested events and finality stalls
//! - Relay deliveries and attempts
//! - Order state transitions and execution outcomes

use crate::error::{RelayerError, RelayerResult};
use crate::types::ChainId;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Encoder, Gauge, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "htlc_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "htlc_chain_block_height",
        "Latest observed block height per chain",
        &["chain"]
    ).unwrap();

    pub static ref FINALITY_STALLS: CounterVec = register_counter_vec!(
        "htlc_finality_stalls_total",
        "Events that gave up waiting for finality",
        &["chain"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "htlc_events_received_total",
        "Total events received by type",
        &["chain", "event_type"]
    ).unwrap();

    // Relay metrics
    pub static ref MESSAGES: CounterVec = register_counter_vec!(
        "htlc_relay_messages_total",
        "Relay messages by type and outcome",
        &["message_type", "status"]
    ).unwrap();

    pub static ref RELAY_ATTEMPTS: CounterVec = register_counter_vec!(
        "htlc_relay_attempts_total",
        "Delivery attempts per destination chain",
        &["chain", "result"]
    ).unwrap();

    // Order metrics
    pub static ref ORDER_TRANSITIONS: CounterVec = register_counter_vec!(
        "htlc_order_transitions_total",
        "Order state transitions by target state",
        &["state"]
    ).unwrap();

    pub static ref ACTIVE_ORDERS: Gauge = register_gauge!(
        "htlc_active_orders",
        "Orders not yet in a terminal state"
    ).unwrap();

    pub static ref EXECUTIONS: CounterVec = register_counter_vec!(
        "htlc_executions_total",
        "Execution outcomes",
        &["outcome"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "htlc_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "htlc_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Internal(format!("bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Text exposition of every registered metric
pub fn render() -> RelayerResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| RelayerError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| RelayerError::Internal(e.to_string()))
}

// Helper functions to record metrics

/// `head` is None when the chain did not answer
pub fn record_chain_health(chain: ChainId, head: Option<u64>) {
    CHAIN_CONNECTED
        .with_label_values(&[chain.as_str()])
        .set(if head.is_some() { 1.0 } else { 0.0 });
    if let Some(head) = head {
        record_blocks_processed(chain, head);
    }
}

pub fn record_blocks_processed(chain: ChainId, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[chain.as_str()])
        .set(block_number as f64);
}

pub fn record_finality_stall(chain: ChainId) {
    FINALITY_STALLS.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_event(chain: ChainId, event_type: &str) {
    EVENTS_RECEIVED
        .with_label_values(&[chain.as_str(), event_type])
        .inc();
}

pub fn record_message(message_type: &str, status: &str) {
    MESSAGES.with_label_values(&[message_type, status]).inc();
}

pub fn record_relay_attempt(chain: ChainId, result: &str) {
    RELAY_ATTEMPTS.with_label_values(&[chain.as_str(), result]).inc();
}

pub fn record_transition(state: &str) {
    ORDER_TRANSITIONS.with_label_values(&[state]).inc();
}

pub fn set_active_orders(count: usize) {
    ACTIVE_ORDERS.set(count as f64);
}

pub fn record_execution(outcome: &str) {
    EXECUTIONS.with_label_values(&[outcome]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
