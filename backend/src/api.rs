//! Read side of the points ledger.

use alloy_primitives::Address;
use axum::{extract::Query, http::StatusCode, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::indexer::db::{address_key, PointsLedger};

#[derive(Debug, Deserialize)]
pub(crate) struct PointsQuery {
    address: String,
}

/// Point balance of one account.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct PointsResponse {
    address: String,
    points: i64,
}

pub(crate) async fn get_points(
    ledger: PointsLedger,
    Query(query): Query<PointsQuery>,
) -> Result<Json<PointsResponse>, (StatusCode, String)> {
    let address: Address = query.address.trim().parse().map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            format!("invalid address `{}`: {e}", query.address),
        )
    })?;

    let points = ledger.sum_points(&address).await.map_err(|e| {
        error!(%address, %e, "Failed to sum points");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to read points".to_string(),
        )
    })?;

    Ok(Json(PointsResponse {
        address: address_key(&address),
        points,
    }))
}

pub(crate) async fn health() -> &'static str {
    "ok"
}

pub(crate) fn router(ledger: PointsLedger) -> Router {
    let cors = CorsLayer::new().allow_origin(Any);

    Router::new()
        .route(
            "/api/points",
            get(move |query: Query<PointsQuery>| get_points(ledger.clone(), query)),
        )
        .route("/api/health", get(health))
        .layer(cors)
}
