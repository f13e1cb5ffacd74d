// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::ledger::LedgerError;
use crate::orchestrator::TransferError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::DuplicateTag(tag) => Self::conflict(format!("tag @{tag} already taken")),
            LedgerError::NotFound(what) => Self::not_found(what),
            LedgerError::InsufficientFunds {
                available,
                requested,
            } => Self::unprocessable(format!(
                "insufficient funds: have {available}, need {requested}"
            )),
            other => {
                tracing::error!(error = %other, "Ledger failure");
                Self::internal("ledger failure")
            }
        }
    }
}

impl From<TransferError> for ApiError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::UnknownUser => Self::unauthorized("unknown user"),
            TransferError::UnknownTag(_) | TransferError::UnknownToken(_) => {
                Self::not_found(e.to_string())
            }
            TransferError::SelfTransfer | TransferError::InvalidAmount(_) => {
                Self::bad_request(e.to_string())
            }
            TransferError::InsufficientBalance { .. } => Self::unprocessable(e.to_string()),
            TransferError::ChainUnavailable(_) | TransferError::OnchainTransfer(_) => {
                tracing::error!(error = %e, "Transfer failed on-chain");
                Self::service_unavailable(e.to_string())
            }
            TransferError::Ledger(inner) => inner.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn constructors_set_status_and_message() {
        let nf = ApiError::not_found("missing");
        assert_eq!(nf.status, StatusCode::NOT_FOUND);
        assert_eq!(nf.message, "missing");

        let conflict = ApiError::conflict("taken");
        assert_eq!(conflict.status, StatusCode::CONFLICT);
    }

    #[test]
    fn transfer_errors_map_to_statuses() {
        let insufficient: ApiError = TransferError::InsufficientBalance {
            available: 1.0,
            requested: 2.0,
        }
        .into();
        assert_eq!(insufficient.status, StatusCode::UNPROCESSABLE_ENTITY);

        let unknown: ApiError = TransferError::UnknownTag("bob".to_string()).into();
        assert_eq!(unknown.status, StatusCode::NOT_FOUND);

        let bad: ApiError = TransferError::SelfTransfer.into();
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);

        let overdraft: ApiError = LedgerError::InsufficientFunds {
            available: 1.0,
            requested: 2.0,
        }
        .into();
        assert_eq!(overdraft.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn into_response_returns_json_body() {
        let response = ApiError::bad_request("bad data").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body_bytes.to_vec()).unwrap();
        assert_eq!(body, r#"{"error":"bad data"}"#);
    }
}
