// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use utoipa::IntoParams;

use crate::{error::ApiError, ledger::models::Notification, state::AppState};

use super::identity::Caller;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 200;

#[derive(Deserialize, IntoParams)]
pub struct NotificationQuery {
    pub limit: Option<usize>,
}

#[utoipa::path(
    get,
    path = "/v1/notifications",
    params(NotificationQuery),
    tag = "Notifications",
    responses((status = 200, body = [Notification]))
)]
pub async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
    caller: Caller,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let notifications = state.ledger.list_notifications(&caller.user_id, limit)?;
    Ok(Json(notifications))
}
