// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

use axum::{
    routing::{get, post},
    Router,
};
use axum::http::HeaderName;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    ledger::models::{LedgerTransaction, Notification, TxStatus, TxType, User},
    state::AppState,
};

pub mod health;
pub mod identity;
pub mod notifications;
pub mod tags;
pub mod transfers;

pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/tags", post(tags::register_tag))
        .route("/tags/{tag}/balances", get(tags::get_balances))
        .route("/tags/{tag}/transactions", get(tags::list_transactions))
        .route("/transfers/tag", post(transfers::transfer_to_tag))
        .route("/transfers/wallet", post(transfers::transfer_to_wallet))
        .route("/notifications", get(notifications::list_notifications))
        .route("/health", get(health::health))
        .with_state(state);

    let request_id_header = HeaderName::from_static("x-request-id");
    Router::new()
        .nest("/v1", v1_routes)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(
            request_id_header,
            tower_http::request_id::MakeRequestUuid,
        ))
        .layer(CorsLayer::permissive())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        tags::register_tag,
        tags::get_balances,
        tags::list_transactions,
        transfers::transfer_to_tag,
        transfers::transfer_to_wallet,
        notifications::list_notifications,
        health::health
    ),
    components(
        schemas(
            User,
            LedgerTransaction,
            Notification,
            TxType,
            TxStatus,
            tags::RegisterTagRequest,
            tags::RegisterTagResponse,
            tags::WalletInfo,
            tags::BalanceView,
            transfers::TagTransferRequest,
            transfers::WalletTransferRequest,
            transfers::TransferResponse,
            health::HealthResponse
        )
    ),
    tags(
        (name = "Tags", description = "Tag registration and ledger views"),
        (name = "Transfers", description = "Tag and external wallet transfers"),
        (name = "Notifications", description = "User notifications"),
        (name = "Health", description = "Service health")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    use crate::chain::mock::MockChainAdapter;
    use crate::chain::{AdapterRegistry, ChainAdapter};
    use crate::ledger::LedgerStore;
    use crate::tokens::TokenRegistry;

    fn test_app() -> (tempfile::TempDir, AppState, Router) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(LedgerStore::open(&dir.path().join("ledger.redb")).unwrap());
        let mut adapters = AdapterRegistry::new();
        adapters.insert(Arc::new(MockChainAdapter::new("STRK", 18)) as Arc<dyn ChainAdapter>);
        let state = AppState::new(ledger, Arc::new(adapters), Arc::new(TokenRegistry::default()));
        let app = router(state.clone());
        (dir, state, app)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn register_then_read_balances() {
        let (_dir, _state, app) = test_app();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/tags")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"tag":"alice"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let user_id = created["user"]["id"].as_str().unwrap().to_string();
        assert_eq!(created["user"]["tag"], "alice");
        assert_eq!(created["wallets"][0]["chain"], "STRK");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/tags/alice/balances")
                    .header("x-user-id", &user_id)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let balances = body_json(response).await;
        assert_eq!(balances[0]["token"], "STRK");
        assert_eq!(balances[0]["amount"], 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn registration_survives_a_transient_chain_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(LedgerStore::open(&dir.path().join("ledger.redb")).unwrap());
        let adapter = Arc::new(MockChainAdapter::new("STRK", 18));
        adapter
            .fail_registers
            .store(1, std::sync::atomic::Ordering::SeqCst);
        let mut adapters = AdapterRegistry::new();
        adapters.insert(adapter as Arc<dyn ChainAdapter>);
        let state = AppState::new(ledger, Arc::new(adapters), Arc::new(TokenRegistry::default()));
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/tags")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"tag":"carol"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["wallets"][0]["chain"], "STRK");
    }

    #[tokio::test]
    async fn duplicate_tag_conflicts() {
        let (_dir, _state, app) = test_app();
        let request = || {
            Request::builder()
                .method("POST")
                .uri("/v1/tags")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"tag":"bob"}"#))
                .unwrap()
        };

        assert_eq!(
            app.clone().oneshot(request()).await.unwrap().status(),
            StatusCode::CREATED
        );
        assert_eq!(
            app.oneshot(request()).await.unwrap().status(),
            StatusCode::CONFLICT
        );
    }

    #[tokio::test]
    async fn balances_of_another_user_are_forbidden() {
        let (_dir, state, app) = test_app();
        state.ledger.create_user("alice").unwrap();
        let intruder = state.ledger.create_user("mallory").unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/tags/alice/balances")
                    .header("x-user-id", &intruder.id)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn tag_transfer_end_to_end() {
        let (_dir, state, app) = test_app();
        let alice = state.ledger.create_user("alice").unwrap();
        let bob = state.ledger.create_user("bob").unwrap();
        state
            .ledger
            .get_or_create_balance(&alice.id, 1, "0xalice")
            .unwrap();
        state
            .ledger
            .get_or_create_balance(&bob.id, 1, "0xbob")
            .unwrap();
        state.ledger.apply_delta(&alice.id, 1, 40.0, 0.0).unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/transfers/tag")
                    .header("content-type", "application/json")
                    .header("x-user-id", &alice.id)
                    .body(Body::from(
                        r#"{"recipient_tag":"bob","token":"STRK","amount":15.0}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert!(body["tx_hash"].as_str().unwrap().starts_with("0xmocktx"));
        assert!(body["credit_reference"].as_str().unwrap().ends_with("-c"));

        let bob_balance = state.ledger.get_balance(&bob.id, 1).unwrap().unwrap();
        assert!((bob_balance.amount - 15.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn overdraft_is_unprocessable() {
        let (_dir, state, app) = test_app();
        let alice = state.ledger.create_user("alice").unwrap();
        state.ledger.create_user("bob").unwrap();
        state
            .ledger
            .get_or_create_balance(&alice.id, 1, "0xalice")
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/transfers/tag")
                    .header("content-type", "application/json")
                    .header("x-user-id", &alice.id)
                    .body(Body::from(
                        r#"{"recipient_tag":"bob","token":"STRK","amount":5.0}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn missing_identity_is_unauthorized() {
        let (_dir, _state, app) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/notifications")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_lists_configured_chains() {
        let (_dir, _state, app) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["chains"][0], "STRK");
    }
}
