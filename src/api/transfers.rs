// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! Transfer endpoints. All validation and sequencing lives in the
//! orchestrator; these handlers only shape requests and responses.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{error::ApiError, orchestrator::TransferOutcome, state::AppState};

use super::identity::Caller;

#[derive(Deserialize, ToSchema)]
pub struct TagTransferRequest {
    pub recipient_tag: String,
    pub token: String,
    pub amount: f64,
}

#[derive(Deserialize, ToSchema)]
pub struct WalletTransferRequest {
    pub address: String,
    pub token: String,
    pub amount: f64,
}

#[derive(Serialize, ToSchema)]
pub struct TransferResponse {
    pub tx_hash: String,
    pub debit_reference: String,
    pub credit_reference: Option<String>,
}

impl From<TransferOutcome> for TransferResponse {
    fn from(outcome: TransferOutcome) -> Self {
        Self {
            tx_hash: outcome.tx_hash,
            debit_reference: outcome.debit.reference,
            credit_reference: outcome.credit.map(|tx| tx.reference),
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/transfers/tag",
    request_body = TagTransferRequest,
    tag = "Transfers",
    responses(
        (status = 201, body = TransferResponse),
        (status = 404, description = "Unknown recipient tag or token"),
        (status = 422, description = "Insufficient balance"),
        (status = 503, description = "On-chain submission failed")
    )
)]
pub async fn transfer_to_tag(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<TagTransferRequest>,
) -> Result<(StatusCode, Json<TransferResponse>), ApiError> {
    let outcome = state
        .orchestrator
        .send_to_tag(
            &caller.user_id,
            &request.recipient_tag,
            &request.token,
            request.amount,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(outcome.into())))
}

#[utoipa::path(
    post,
    path = "/v1/transfers/wallet",
    request_body = WalletTransferRequest,
    tag = "Transfers",
    responses(
        (status = 201, body = TransferResponse),
        (status = 404, description = "Unknown token"),
        (status = 422, description = "Insufficient balance"),
        (status = 503, description = "On-chain submission failed")
    )
)]
pub async fn transfer_to_wallet(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<WalletTransferRequest>,
) -> Result<(StatusCode, Json<TransferResponse>), ApiError> {
    let outcome = state
        .orchestrator
        .send_to_wallet(
            &caller.user_id,
            &request.address,
            &request.token,
            request.amount,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(outcome.into())))
}
