//! HTTP API for settlement, rates and health checks

use crate::config::ApiConfig;
use crate::error::{Rejection, SettlerError, SettlerResult, SubmitError};
use crate::intent::{ChainSide, Direction, Intent};
use crate::oracle::{OracleStats, PriceRecord, RateSnapshot};
use crate::settlement::{QuotePreview, SettlementEngine, SubmitOutcome};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 1000;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SettlementEngine>,
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, engine: Arc<SettlementEngine>) -> SettlerResult<()> {
    let app = router(AppState { engine });

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SettlerError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| SettlerError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/settle", post(settle))
        .route("/intents/:id", get(get_intent))
        .route("/rate", get(get_rate))
        .route("/rate/history", get(get_rate_history))
        .route("/oracle/stats", get(get_oracle_stats))
        .route("/quote", get(get_quote))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Failure answer for every endpoint
enum ApiError {
    Rejected(Rejection),
    BadRequest(String),
    NotFound(String),
    Infrastructure(SettlerError),
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Rejected(rejection) => ApiError::Rejected(rejection),
            SubmitError::Infrastructure(e) => ApiError::Infrastructure(e),
        }
    }
}

impl From<SettlerError> for ApiError {
    fn from(err: SettlerError) -> Self {
        ApiError::Infrastructure(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Rejected(rejection) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorResponse {
                    error: rejection.to_string(),
                    rejection: Some(rejection),
                },
            ),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, ErrorResponse::plain(message)),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, ErrorResponse::plain(message)),
            ApiError::Infrastructure(e) => {
                error!("Request failed: {}", e);
                let status = if e.is_retryable() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (status, ErrorResponse::plain(e.to_string()))
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Submit a deposit for settlement
async fn settle(
    State(state): State<AppState>,
    Json(request): Json<SettleRequest>,
) -> Result<(StatusCode, Json<SubmitOutcome>), ApiError> {
    if request.deposit_reference.trim().is_empty() {
        return Err(ApiError::BadRequest("deposit_reference is required".to_string()));
    }

    let outcome = state
        .engine
        .submit_deposit(request.direction, &request.deposit_reference)
        .await?;

    let status = if outcome.existing {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)))
}

async fn get_intent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Intent>, ApiError> {
    state
        .engine
        .get_intent(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Intent {} not found", id)))
}

async fn get_rate(State(state): State<AppState>) -> Json<RateSnapshot> {
    Json(state.engine.oracle().current_rate().await)
}

async fn get_rate_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<PriceRecord>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    Json(state.engine.oracle().history(limit).await)
}

async fn get_oracle_stats(State(state): State<AppState>) -> Json<OracleStats> {
    Json(state.engine.oracle().stats().await)
}

async fn get_quote(
    State(state): State<AppState>,
    Query(query): Query<QuoteQuery>,
) -> Result<Json<QuotePreview>, ApiError> {
    if !(query.amount.is_finite() && query.amount > 0.0) {
        return Err(ApiError::BadRequest(format!(
            "amount must be positive, got {}",
            query.amount
        )));
    }
    Ok(Json(state.engine.quote(query.direction, query.amount).await))
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify the store and both chains
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.engine.store().health_check().await.is_ok();

    let chain_health = state.engine.chains().health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let ready = store_ok && chains_ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            store: store_ok,
            chains: chains_ok,
            details: chain_health
                .into_iter()
                .map(|(side, healthy)| ChainHealth { side, healthy })
                .collect(),
        }),
    )
}

// Request and response types

#[derive(Deserialize)]
struct SettleRequest {
    direction: Direction,
    deposit_reference: String,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct QuoteQuery {
    direction: Direction,
    amount: f64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    rejection: Option<Rejection>,
}

impl ErrorResponse {
    fn plain(error: String) -> Self {
        Self {
            error,
            rejection: None,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    side: ChainSide,
    healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::fake::FakeChain;
    use crate::chain::{ChainEndpoint, ChainManager};
    use crate::clock::ManualClock;
    use crate::config::tests::SAMPLE;
    use crate::config::Settings;
    use crate::oracle::tests::test_config;
    use crate::oracle::PriceOracle;
    use crate::state::MemoryIntentStore;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app() -> Router {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let chains = Arc::new(ChainManager::new(15, clock.clone()));
        for (side, name, asset) in [(ChainSide::A, "alpha", "AAA"), (ChainSide::B, "beta", "BBB")] {
            chains.register(ChainEndpoint {
                side,
                name: name.to_string(),
                chain_id: 1,
                asset: asset.to_string(),
                custody_address: "0xcustody".to_string(),
                client: Arc::new(FakeChain::new(name, 10.0)),
            });
        }

        let settings = Settings::from_toml(SAMPLE).unwrap();
        let oracle = Arc::new(PriceOracle::new(test_config(), clock.clone()));
        let engine = Arc::new(SettlementEngine::new(
            Arc::new(MemoryIntentStore::new()),
            chains,
            oracle,
            settings.settler,
            clock,
        ));
        router(AppState { engine })
    }

    async fn send(request: Request<Body>) -> (StatusCode, Value) {
        let response = app().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_deposit_is_unprocessable() {
        let request = Request::builder()
            .method("POST")
            .uri("/settle")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"direction":"a_to_b","deposit_reference":"0xmissing"}"#,
            ))
            .unwrap();

        let (status, body) = send(request).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["rejection"]["reason"], "deposit_not_found");
    }

    #[tokio::test]
    async fn test_unknown_intent_is_not_found() {
        let (status, _) = send(get("/intents/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_quote_requires_positive_amount() {
        let (status, _) = send(get("/quote?direction=a_to_b&amount=0")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(get("/quote?direction=a_to_b&amount=100")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["amount_out"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_rate_history_starts_with_initial_record() {
        let (status, body) = send(get("/rate/history?limit=5")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ready_when_store_and_chains_healthy() {
        let (status, body) = send(get("/ready")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
        assert_eq!(body["details"].as_array().unwrap().len(), 2);
    }
}
