// =============================================================================
// REST API Endpoints: Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Reads serve the latest pipeline
// snapshot; writes queue a selection change and return 202 immediately, the
// outcome then shows up in later snapshots.
//
// CORS is configured permissively so a browser chart can be served from any
// origin during development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::binance::rate_limit::WeightSnapshot;
use crate::error::PipelineError;
use crate::market_data::series::{ChartFrame, SeriesState};
use crate::types::{Selection, SymbolInfo, Timeframe};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/catalog", get(catalog))
        .route("/api/v1/selection", get(get_selection).post(set_selection))
        .route("/api/v1/selection/refresh", post(refresh_selection))
        .route("/api/v1/series", get(series))
        .route("/api/v1/chart", get(chart))
        .route("/api/v1/price", get(price))
        .route("/api/v1/errors", get(errors))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Errors
// =============================================================================

/// Maps pipeline errors onto HTTP responses.
pub struct ApiError(pub PipelineError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            PipelineError::InvalidSelection(_) => StatusCode::BAD_REQUEST,
            PipelineError::ServiceStopped => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    pipeline_version: u64,
    ws_clients: usize,
    request_weight: WeightSnapshot,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = chrono::Utc::now().timestamp_millis();
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        pipeline_version: state.chart.series().version,
        ws_clients: state.ws_client_count(),
        request_weight: state.request_weight.snapshot(now),
        server_time: now,
    })
}

// =============================================================================
// Catalog
// =============================================================================

#[derive(Serialize)]
struct CatalogResponse<'a> {
    symbols: &'a [SymbolInfo],
    timeframes: [Timeframe; 6],
}

async fn catalog(State(state): State<Arc<AppState>>) -> Response {
    Json(CatalogResponse {
        symbols: state.chart.catalog(),
        timeframes: Timeframe::ALL,
    })
    .into_response()
}

// =============================================================================
// Selection
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SelectionRequest {
    pub symbol: String,
    pub timeframe: String,
}

impl SelectionRequest {
    pub fn into_selection(self) -> Result<Selection, PipelineError> {
        let timeframe = self.timeframe.parse::<Timeframe>()?;
        Ok(Selection::new(self.symbol, timeframe))
    }
}

#[derive(Serialize)]
struct SelectionResponse {
    selection: Option<Selection>,
    state: SeriesState,
}

async fn get_selection(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.chart.series();
    Json(SelectionResponse {
        selection: snapshot.selection,
        state: snapshot.state,
    })
}

async fn set_selection(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SelectionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let selection = req.into_selection().inspect_err(|e| {
        warn!(error = %e, "selection request rejected");
    })?;
    state.chart.set_selection(selection.clone())?;
    info!(selection = %selection, "selection changed via API");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "selection": selection })),
    ))
}

async fn refresh_selection(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    state.chart.refresh()?;
    info!("pipeline refresh requested via API");
    Ok(StatusCode::ACCEPTED)
}

// =============================================================================
// Series views
// =============================================================================

async fn series(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.chart.series())
}

#[derive(Serialize)]
struct ChartResponse {
    selection: Option<Selection>,
    state: SeriesState,
    #[serde(flatten)]
    frame: ChartFrame,
}

async fn chart(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.chart.series();
    Json(ChartResponse {
        frame: snapshot.chart_frame(),
        selection: snapshot.selection,
        state: snapshot.state,
    })
}

async fn price(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.chart.series().price())
}

async fn errors(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.error_log.recent())
}

// =============================================================================
// Tests
// =============================================================================
