//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Intent lifecycle and rejections
//! - Payout dispatch
//! - Oracle rate and circuit breaker
//! - Chain health and custody balances

use crate::error::{SettlerError, SettlerResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    register_int_counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, IntCounter,
    TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Intent metrics
    pub static ref INTENTS_CREATED: CounterVec = register_counter_vec!(
        "settler_intents_created_total",
        "Intents created by initial status",
        &["status"]
    ).unwrap();

    pub static ref INTENTS_FULFILLED: CounterVec = register_counter_vec!(
        "settler_intents_fulfilled_total",
        "Intents fulfilled by direction",
        &["direction"]
    ).unwrap();

    pub static ref INTENTS_EXPIRED: IntCounter = register_int_counter!(
        "settler_intents_expired_total",
        "Intents expired before settlement"
    ).unwrap();

    pub static ref INTENTS_FAILED: IntCounter = register_int_counter!(
        "settler_intents_failed_total",
        "Intents failed after exhausting dispatch attempts"
    ).unwrap();

    pub static ref SETTLEMENT_LATENCY: HistogramVec = register_histogram_vec!(
        "settler_settlement_latency_seconds",
        "Time from intent creation to confirmed payout",
        &["direction"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0, 3600.0]
    ).unwrap();

    pub static ref REJECTIONS: CounterVec = register_counter_vec!(
        "settler_rejections_total",
        "Deposits rejected before an intent was stored",
        &["reason"]
    ).unwrap();

    // Dispatch metrics
    pub static ref DISPATCH_ATTEMPTS: CounterVec = register_counter_vec!(
        "settler_dispatch_attempts_total",
        "Payout dispatches started",
        &["chain"]
    ).unwrap();

    pub static ref DISPATCH_ERRORS: CounterVec = register_counter_vec!(
        "settler_dispatch_errors_total",
        "Payout dispatches that failed or reverted",
        &["chain"]
    ).unwrap();

    // Oracle metrics
    pub static ref SPOT_RATE: Gauge = register_gauge!(
        "settler_spot_rate",
        "Virtual reserve spot rate (B per A)"
    ).unwrap();

    pub static ref EFFECTIVE_RATE: Gauge = register_gauge!(
        "settler_effective_rate",
        "Blended EMA/TWAP rate exposed to clients"
    ).unwrap();

    pub static ref CIRCUIT_BREAKER: IntCounter = register_int_counter!(
        "settler_circuit_breaker_triggers_total",
        "Total circuit breaker triggers"
    ).unwrap();

    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "settler_chain_connected",
        "Chain health status (1=healthy, 0=unhealthy)",
        &["chain"]
    ).unwrap();

    pub static ref CUSTODY_BALANCE: GaugeVec = register_gauge_vec!(
        "settler_custody_balance",
        "Last observed custody balance per chain",
        &["chain"]
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

    pub async fn run(&self) -> SettlerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SettlerError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| SettlerError::Internal(format!("Metrics server failed: {}", e)))?;

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
pub fn render() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}

// Helper functions to record metrics

pub fn record_intent_created(status: &str) {
    INTENTS_CREATED.with_label_values(&[status]).inc();
}

pub fn record_intent_fulfilled(direction: &str, latency_secs: f64) {
    INTENTS_FULFILLED.with_label_values(&[direction]).inc();
    SETTLEMENT_LATENCY
        .with_label_values(&[direction])
        .observe(latency_secs);
}

pub fn record_intent_expired() {
    INTENTS_EXPIRED.inc();
}

pub fn record_intent_failed() {
    INTENTS_FAILED.inc();
}

pub fn record_rejection(reason: &str) {
    REJECTIONS.with_label_values(&[reason]).inc();
}

pub fn record_dispatch_attempt(chain: &str) {
    DISPATCH_ATTEMPTS.with_label_values(&[chain]).inc();
}

pub fn record_dispatch_error(chain: &str) {
    DISPATCH_ERRORS.with_label_values(&[chain]).inc();
}

pub fn record_rate(spot: f64, effective: f64) {
    SPOT_RATE.set(spot);
    EFFECTIVE_RATE.set(effective);
}

pub fn record_circuit_breaker() {
    CIRCUIT_BREAKER.inc();
}

pub fn record_chain_health(chain: &str, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_custody_balance(chain: &str, balance: f64) {
    CUSTODY_BALANCE.with_label_values(&[chain]).set(balance);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_labelled_by_reason() {
        let before = REJECTIONS.with_label_values(&["nonce_replay"]).get();
        record_rejection("nonce_replay");
        assert_eq!(
            REJECTIONS.with_label_values(&["nonce_replay"]).get(),
            before + 1.0
        );
    }

    #[test]
    fn test_render_includes_registered_metrics() {
        record_chain_health("alpha", true);
        let text = render().unwrap();
        assert!(text.contains("settler_chain_connected"));
    }
}
