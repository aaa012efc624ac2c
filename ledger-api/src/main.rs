use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use alloy_primitives::Address;
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::DateTime;
use ledger_core::{
    config::LedgerConfig,
    db::{create_pool, run_migrations},
    models::LedgerRow,
    query::{BlockId, LedgerQuery, NoChainReader},
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct AppState {
    query: Arc<LedgerQuery<NoChainReader>>,
}

async fn health() -> &'static str {
    "ok"
}

async fn latest_transfers_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<LedgerRow>>, StatusCode> {
    state
        .query
        .latest_transfers()
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[derive(Debug, Deserialize)]
struct TimeWindow {
    /// Unix seconds, inclusive.
    from_time: i64,
    to_time: i64,
}

async fn account_transfers_by_time_handler(
    State(state): State<AppState>,
    Path(addr): Path<String>,
    Query(window): Query<TimeWindow>,
) -> Result<Json<Vec<LedgerRow>>, StatusCode> {
    let account = Address::from_str(&addr).map_err(|_| StatusCode::BAD_REQUEST)?;
    let from = DateTime::from_timestamp(window.from_time, 0).ok_or(StatusCode::BAD_REQUEST)?;
    let to = DateTime::from_timestamp(window.to_time, 0).ok_or(StatusCode::BAD_REQUEST)?;

    state
        .query
        .account_transfers_by_time(account, from, to)
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[derive(Debug, Deserialize)]
struct BlockWindow {
    /// Block number, block hash, or "latest" / "earliest".
    from: String,
    to: String,
}

async fn account_transfers_by_block_handler(
    State(state): State<AppState>,
    Path(addr): Path<String>,
    Query(window): Query<BlockWindow>,
) -> Result<Json<Vec<LedgerRow>>, StatusCode> {
    let account = Address::from_str(&addr).map_err(|_| StatusCode::BAD_REQUEST)?;
    let from = BlockId::from_str(&window.from).map_err(|_| StatusCode::BAD_REQUEST)?;
    let to = BlockId::from_str(&window.to).map_err(|_| StatusCode::BAD_REQUEST)?;

    state
        .query
        .account_transfers_by_block(account, from, to)
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = LedgerConfig::from_env()?;

    let pool = create_pool(&config.db.url, config.db.max_connections).await?;
    run_migrations(&pool).await?;

    // The API serves the store directly. Without a node attached, hash and
    // "latest" block bounds resolve to empty results.
    let state = AppState {
        query: Arc::new(LedgerQuery::new(pool, NoChainReader)),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/transfers/latest", get(latest_transfers_handler))
        .route(
            "/account/:addr/transfers",
            get(account_transfers_by_time_handler),
        )
        .route(
            "/account/:addr/transfers/range",
            get(account_transfers_by_block_handler),
        )
        .with_state(state);

    let addr: SocketAddr = config.api.bind_addr.parse()?;
    tracing::info!("starting ledger API on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
