use crate::brave::{SearchKind, SearchParams};
use crate::types::*;
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/api/search/:kind", get(search_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        aggregator: state.aggregator.stats(),
    })
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<SearchKind>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Arc<serde_json::Value>>, ApiError> {
    if !state.brave.has_api_key() {
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Brave Search API key not configured",
        ));
    }
    if query.q.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Missing required parameter: q",
        ));
    }

    let params = SearchParams::new(query.q, query.count, query.offset);
    let key = params.coalesce_key(kind);
    info!("Processing {} search request: {}", kind, key);

    let client = state.brave.clone();
    let result = state
        .aggregator
        .execute(&key, move || async move { client.search(kind, &params).await })
        .await;

    match result {
        Ok(body) => Ok(Json(body)),
        Err(e) => {
            error!("{} search failed for {}: {}", kind, key, e);
            let status = match e.producer_error() {
                Some(err) if err.is_rate_limited() => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Err(api_error(
                status,
                format!("Failed to fetch {} results", kind.describe()),
            ))
        }
    }
}
