// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! Tag registration and per-tag ledger views.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    error::ApiError,
    ledger::models::{LedgerTransaction, User},
    retry,
    state::AppState,
};

use super::identity::Caller;

/// Tags are Cairo short strings on Starknet, which caps them at 31 bytes.
const TAG_MIN_LEN: usize = 3;
const TAG_MAX_LEN: usize = 31;

const DEFAULT_TX_LIMIT: usize = 50;
const MAX_TX_LIMIT: usize = 200;

#[derive(Deserialize, ToSchema)]
pub struct RegisterTagRequest {
    pub tag: String,
}

#[derive(Serialize, ToSchema)]
pub struct RegisterTagResponse {
    pub user: User,
    /// Chains the tag was registered on, with the derived vault address.
    pub wallets: Vec<WalletInfo>,
}

#[derive(Serialize, ToSchema)]
pub struct WalletInfo {
    pub chain: String,
    pub address: String,
}

#[derive(Serialize, ToSchema)]
pub struct BalanceView {
    pub token: String,
    pub amount: f64,
    pub usd_value: f64,
    pub wallet_address: String,
}

#[derive(Deserialize, IntoParams)]
pub struct TxListQuery {
    /// Max entries to return, newest first.
    pub limit: Option<usize>,
}

fn validate_tag(tag: &str) -> Result<(), ApiError> {
    let tag = tag.trim();
    if tag.len() < TAG_MIN_LEN || tag.len() > TAG_MAX_LEN {
        return Err(ApiError::bad_request(format!(
            "tag must be {TAG_MIN_LEN}-{TAG_MAX_LEN} characters"
        )));
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ApiError::bad_request(
            "tag may only contain letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

#[utoipa::path(
    post,
    path = "/v1/tags",
    request_body = RegisterTagRequest,
    tag = "Tags",
    responses(
        (status = 201, body = RegisterTagResponse),
        (status = 400, description = "Malformed tag"),
        (status = 409, description = "Tag already taken")
    )
)]
pub async fn register_tag(
    State(state): State<AppState>,
    Json(request): Json<RegisterTagRequest>,
) -> Result<(StatusCode, Json<RegisterTagResponse>), ApiError> {
    validate_tag(&request.tag)?;
    let user = state.ledger.create_user(&request.tag)?;

    // Register the tag on every configured chain and seed zero balance
    // rows. A chain that is down gets picked up on first use instead.
    let mut wallets = Vec::new();
    for adapter in state.adapters.all() {
        let Some(token) = state.tokens.by_symbol(adapter.chain_key()) else {
            continue;
        };
        let registered = retry::with_backoff(
            "tag registration",
            retry::DEFAULT_ATTEMPTS,
            retry::DEFAULT_BASE_DELAY,
            || adapter.register_tag(&user.tag),
        )
        .await;
        match registered {
            Ok(address) => {
                state
                    .ledger
                    .get_or_create_balance(&user.id, token.id, &address)?;
                wallets.push(WalletInfo {
                    chain: adapter.chain_key().to_string(),
                    address,
                });
            }
            Err(e) => {
                tracing::warn!(
                    chain = adapter.chain_key(),
                    tag = %user.tag,
                    error = %e,
                    "On-chain tag registration failed, deferring"
                );
            }
        }
    }

    tracing::info!(tag = %user.tag, chains = wallets.len(), "Tag registered");
    Ok((
        StatusCode::CREATED,
        Json(RegisterTagResponse { user, wallets }),
    ))
}

#[utoipa::path(
    get,
    path = "/v1/tags/{tag}/balances",
    params(("tag" = String, Path, description = "Tag whose balances to list")),
    tag = "Tags",
    responses(
        (status = 200, body = [BalanceView]),
        (status = 403, description = "Caller does not own this tag"),
        (status = 404, description = "Unknown tag")
    )
)]
pub async fn get_balances(
    State(state): State<AppState>,
    Path(tag): Path<String>,
    caller: Caller,
) -> Result<Json<Vec<BalanceView>>, ApiError> {
    let user = resolve_owned_tag(&state, &tag, &caller)?;

    let balances = state.ledger.list_balances(&user.id)?;
    let views = balances
        .into_iter()
        .filter_map(|balance| {
            let token = state.tokens.by_id(balance.token_id)?;
            Some(BalanceView {
                token: token.symbol.to_string(),
                amount: balance.amount,
                usd_value: state.tokens.usd_value(token.id, balance.amount),
                wallet_address: balance.wallet_address,
            })
        })
        .collect();
    Ok(Json(views))
}

#[utoipa::path(
    get,
    path = "/v1/tags/{tag}/transactions",
    params(
        ("tag" = String, Path, description = "Tag whose history to list"),
        TxListQuery
    ),
    tag = "Tags",
    responses(
        (status = 200, body = [LedgerTransaction]),
        (status = 403, description = "Caller does not own this tag"),
        (status = 404, description = "Unknown tag")
    )
)]
pub async fn list_transactions(
    State(state): State<AppState>,
    Path(tag): Path<String>,
    Query(query): Query<TxListQuery>,
    caller: Caller,
) -> Result<Json<Vec<LedgerTransaction>>, ApiError> {
    let user = resolve_owned_tag(&state, &tag, &caller)?;
    let limit = query.limit.unwrap_or(DEFAULT_TX_LIMIT).min(MAX_TX_LIMIT);
    let transactions = state.ledger.list_transactions_for_user(&user.id, limit)?;
    Ok(Json(transactions))
}

fn resolve_owned_tag(state: &AppState, tag: &str, caller: &Caller) -> Result<User, ApiError> {
    let user = state
        .ledger
        .find_user_by_tag(tag)?
        .ok_or_else(|| ApiError::not_found(format!("no user owns tag @{tag}")))?;
    if user.id != caller.user_id {
        return Err(ApiError::forbidden("tag belongs to another user"));
    }
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_validation() {
        assert!(validate_tag("alice").is_ok());
        assert!(validate_tag("a_b-3").is_ok());
        assert!(validate_tag("ab").is_err());
        assert!(validate_tag(&"x".repeat(32)).is_err());
        assert!(validate_tag("bad tag").is_err());
        assert!(validate_tag("caf\u{e9}!").is_err());
    }
}
