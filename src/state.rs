// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! Shared application state handed to every request handler.

use std::sync::Arc;

use crate::chain::AdapterRegistry;
use crate::ledger::LedgerStore;
use crate::orchestrator::TransferOrchestrator;
use crate::tokens::TokenRegistry;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<LedgerStore>,
    pub adapters: Arc<AdapterRegistry>,
    pub tokens: Arc<TokenRegistry>,
    pub orchestrator: Arc<TransferOrchestrator>,
}

impl AppState {
    pub fn new(
        ledger: Arc<LedgerStore>,
        adapters: Arc<AdapterRegistry>,
        tokens: Arc<TokenRegistry>,
    ) -> Self {
        let orchestrator = Arc::new(TransferOrchestrator::new(
            ledger.clone(),
            adapters.clone(),
            tokens.clone(),
        ));
        Self {
            ledger,
            adapters,
            tokens,
            orchestrator,
        }
    }
}
