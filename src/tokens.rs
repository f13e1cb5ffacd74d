// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! Token and chain reference data.
//!
//! One token per supported chain; the token symbol doubles as the chain key
//! for adapter-registry dispatch. USD prices are held here and refreshed by
//! the price-feed poller; everything else is static.

use std::collections::HashMap;
use std::sync::RwLock;

/// Static token definition.
#[derive(Debug, Clone)]
pub struct TokenSpec {
    /// Stable numeric id used in ledger keys.
    pub id: u32,
    /// Symbol, also the chain key (e.g. "STRK").
    pub symbol: &'static str,
    /// Display name.
    pub name: &'static str,
    /// On-chain fixed-point decimals.
    pub decimals: u8,
}

/// Starknet native staking token, on the Starknet tag-vault.
pub const STRK_TOKEN: TokenSpec = TokenSpec {
    id: 1,
    symbol: "STRK",
    name: "Starknet Token",
    decimals: 18,
};

/// Lisk L2 token.
pub const LSK_TOKEN: TokenSpec = TokenSpec {
    id: 2,
    symbol: "LSK",
    name: "Lisk",
    decimals: 18,
};

/// ETH held on the Base tag-vault.
pub const BASE_TOKEN: TokenSpec = TokenSpec {
    id: 3,
    symbol: "BASE",
    name: "Base ETH",
    decimals: 18,
};

/// Celo native token.
pub const CELO_TOKEN: TokenSpec = TokenSpec {
    id: 4,
    symbol: "CELO",
    name: "Celo",
    decimals: 18,
};

/// Flow token on the Flow EVM tag-vault (Cadence fixed-point, 8 decimals).
pub const FLOW_TOKEN: TokenSpec = TokenSpec {
    id: 5,
    symbol: "FLOW",
    name: "Flow",
    decimals: 8,
};

/// All supported tokens, one per chain.
pub static ALL_TOKENS: [TokenSpec; 5] =
    [STRK_TOKEN, LSK_TOKEN, BASE_TOKEN, CELO_TOKEN, FLOW_TOKEN];

/// Token lookup plus mutable USD prices.
///
/// Prices default to zero until the price feed delivers a quote; `usd_value`
/// columns computed before that are zero, which the dashboard tolerates.
pub struct TokenRegistry {
    prices: RwLock<HashMap<u32, f64>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a token by symbol (case-insensitive).
    pub fn by_symbol(&self, symbol: &str) -> Option<&'static TokenSpec> {
        ALL_TOKENS
            .iter()
            .find(|t| t.symbol.eq_ignore_ascii_case(symbol.trim()))
    }

    /// Look up a token by numeric id.
    pub fn by_id(&self, id: u32) -> Option<&'static TokenSpec> {
        ALL_TOKENS.iter().find(|t| t.id == id)
    }

    /// Current USD price for a token, or `0.0` when no quote has arrived.
    pub fn price(&self, token_id: u32) -> f64 {
        self.prices
            .read()
            .map(|p| p.get(&token_id).copied().unwrap_or(0.0))
            .unwrap_or(0.0)
    }

    /// Update the USD price for a token.
    pub fn set_price(&self, token_id: u32, usd: f64) {
        if let Ok(mut prices) = self.prices.write() {
            prices.insert(token_id, usd);
        }
    }

    /// USD value of a canonical-decimal amount of a token.
    pub fn usd_value(&self, token_id: u32, amount: f64) -> f64 {
        amount * self.price(token_id)
    }
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_ids_are_unique() {
        for (i, a) in ALL_TOKENS.iter().enumerate() {
            for b in &ALL_TOKENS[i + 1..] {
                assert_ne!(a.id, b.id, "{} and {} share an id", a.symbol, b.symbol);
            }
        }
    }

    #[test]
    fn lookup_by_symbol_is_case_insensitive() {
        let reg = TokenRegistry::new();
        assert_eq!(reg.by_symbol("strk").unwrap().id, STRK_TOKEN.id);
        assert_eq!(reg.by_symbol(" FLOW ").unwrap().decimals, 8);
        assert!(reg.by_symbol("DOGE").is_none());
    }

    #[test]
    fn prices_default_to_zero_and_update() {
        let reg = TokenRegistry::new();
        assert_eq!(reg.price(LSK_TOKEN.id), 0.0);
        reg.set_price(LSK_TOKEN.id, 1.25);
        assert_eq!(reg.price(LSK_TOKEN.id), 1.25);
        assert_eq!(reg.usd_value(LSK_TOKEN.id, 4.0), 5.0);
    }
}
