use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::cache::QuoteCache;
use crate::feed::FeedClient;
use crate::logging;

use super::{shutdown_requested, ConnectionState, ShutdownSignal};

#[derive(Clone)]
pub struct AppState {
    pub cache: QuoteCache,
    pub feed: Arc<dyn FeedClient>,
    pub connection: watch::Receiver<ConnectionState>,
}

#[derive(Debug, Deserialize)]
pub struct AddSymbolRequest {
    pub symbol: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("symbol not found")]
    SymbolNotFound,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to serialise response: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::SymbolNotFound => (StatusCode::NOT_FOUND, "Symbol not found"),
            ApiError::InvalidRequest(detail) => {
                logging::warn(
                    "api.invalid_request",
                    "Rejected malformed request body",
                    json!({ "detail": detail }),
                );
                (StatusCode::BAD_REQUEST, "Invalid request")
            }
            ApiError::Serialization(err) => {
                logging::error(
                    "api.serialization_failed",
                    "Unable to serialise cache contents",
                    json!({ "error": err.to_string() }),
                );
                (StatusCode::INTERNAL_SERVER_ERROR, "Unable to fetch data")
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/api/symbol-data", get(list_symbol_data))
        .route("/api/symbol-data/:symbol", get(get_symbol_data))
        .route("/api/symbol", post(add_symbol))
        .route("/api/symbol/:symbol", delete(remove_symbol))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

pub(super) async fn run_api_server(
    addr: SocketAddr,
    state: AppState,
    mut shutdown: watch::Receiver<ShutdownSignal>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP API at {addr}"))?;

    logging::info(
        "api.bind",
        "HTTP API listening",
        json!({ "addr": addr.to_string() }),
    );

    let shutdown_signal = async move {
        shutdown_requested(&mut shutdown).await;
    };

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("HTTP API terminated with error")?;

    logging::info_simple("api.stop", "HTTP API stopped");
    Ok(())
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    let metadata = json!({
        "method": method,
        "path": path,
        "status": status.as_u16(),
        "latency_us": started.elapsed().as_micros() as u64,
    });
    if status.is_server_error() {
        logging::warn("api.request", "Request failed", metadata);
    } else {
        logging::info("api.request", "Request completed", metadata);
    }

    response
}

fn json_body(body: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let feed = *state.connection.borrow();
    let symbols = state.cache.len().await;
    Json(json!({
        "status": "ok",
        "feed": feed,
        "symbols": symbols,
    }))
}

async fn list_symbol_data(State(state): State<AppState>) -> Result<Response, ApiError> {
    let body = state.cache.snapshot_json().await?;
    Ok(json_body(body))
}

async fn get_symbol_data(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Response, ApiError> {
    let entry = state
        .cache
        .get(&symbol)
        .await
        .ok_or(ApiError::SymbolNotFound)?;
    let body = serde_json::to_vec(&entry)?;
    Ok(json_body(body))
}

async fn add_symbol(
    State(state): State<AppState>,
    payload: Result<Json<AddSymbolRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) =
        payload.map_err(|rejection| ApiError::InvalidRequest(rejection.body_text()))?;
    if request.symbol.trim().is_empty() {
        return Err(ApiError::InvalidRequest("symbol must not be empty".into()));
    }

    state.feed.subscribe(&request.symbol);
    logging::info(
        "api.symbol_subscribed",
        "Subscribed symbol on request",
        json!({ "symbol": request.symbol }),
    );

    Ok(Json(json!({
        "message": format!("Symbol {} added", request.symbol),
    })))
}

async fn remove_symbol(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let feed = Arc::clone(&state.feed);
    state
        .cache
        .evict(&symbol, |symbol| feed.unsubscribe(symbol))
        .await
        .ok_or(ApiError::SymbolNotFound)?;

    logging::info(
        "api.symbol_removed",
        "Unsubscribed and evicted symbol",
        json!({ "symbol": symbol }),
    );

    Ok(Json(json!({
        "message": format!("Symbol {symbol} removed"),
    })))
}
