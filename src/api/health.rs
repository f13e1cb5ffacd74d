// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

use axum::{extract::State, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::state::AppState;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Chain keys with a configured adapter.
    pub chains: Vec<String>,
}

#[utoipa::path(
    get,
    path = "/v1/health",
    tag = "Health",
    responses((status = 200, body = HealthResponse))
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut chains: Vec<String> = state
        .adapters
        .all()
        .iter()
        .map(|a| a.chain_key().to_string())
        .collect();
    chains.sort();
    Json(HealthResponse {
        status: "ok",
        chains,
    })
}
