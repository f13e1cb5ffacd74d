// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! Exact fixed-point conversion between canonical decimal amounts and raw
//! chain units.
//!
//! The exact paths operate on `U256` and decimal strings so conversions are
//! precise for the full 2^256 range; `f64` bridges exist only for ledger
//! arithmetic, where the reconciler's epsilon absorbs float noise.

use alloy::primitives::U256;

#[derive(Debug, thiserror::Error)]
pub enum AmountError {
    #[error("malformed amount `{0}`")]
    Malformed(String),

    #[error("negative amounts are not representable: `{0}`")]
    Negative(String),

    #[error("amount `{0}` overflows 256 bits")]
    Overflow(String),
}

/// `10^decimals` as a `U256`.
fn scale(decimals: u8) -> U256 {
    U256::from(10u64).pow(U256::from(decimals))
}

/// Convert a canonical decimal string (e.g. "1.5") to raw chain units.
///
/// Fractional digits beyond the token's declared decimals are truncated,
/// never rounded.
pub fn to_chain_units(amount: &str, decimals: u8) -> Result<U256, AmountError> {
    let amount = amount.trim();
    if amount.is_empty() {
        return Err(AmountError::Malformed(amount.to_string()));
    }
    if amount.starts_with('-') {
        return Err(AmountError::Negative(amount.to_string()));
    }

    let (whole, frac) = match amount.split_once('.') {
        Some((w, f)) => (w, f),
        None => (amount, ""),
    };
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(AmountError::Malformed(amount.to_string()));
    }
    if whole.is_empty() && frac.is_empty() {
        return Err(AmountError::Malformed(amount.to_string()));
    }

    let whole_units = if whole.is_empty() {
        U256::ZERO
    } else {
        U256::from_str_radix(whole, 10)
            .map_err(|_| AmountError::Overflow(amount.to_string()))?
    };

    // Truncate to the declared decimals, then right-pad to a full fraction.
    let frac = &frac[..frac.len().min(decimals as usize)];
    let frac_units = if frac.is_empty() {
        U256::ZERO
    } else {
        let padded = format!("{frac:0<width$}", width = decimals as usize);
        U256::from_str_radix(&padded, 10)
            .map_err(|_| AmountError::Overflow(amount.to_string()))?
    };

    whole_units
        .checked_mul(scale(decimals))
        .and_then(|w| w.checked_add(frac_units))
        .ok_or_else(|| AmountError::Overflow(amount.to_string()))
}

/// Convert raw chain units to a canonical decimal string, exactly.
///
/// Trailing fractional zeros are trimmed ("1.50" becomes "1.5").
pub fn from_chain_units(units: U256, decimals: u8) -> String {
    if units.is_zero() {
        return "0".to_string();
    }

    let divisor = scale(decimals);
    let whole = units / divisor;
    let remainder = units % divisor;

    if remainder.is_zero() {
        whole.to_string()
    } else {
        let frac = format!("{remainder:0>width$}", width = decimals as usize);
        let trimmed = frac.trim_end_matches('0');
        format!("{whole}.{trimmed}")
    }
}

/// Lossy bridge: raw chain units to an `f64` canonical amount.
pub fn units_to_decimal(units: U256, decimals: u8) -> f64 {
    from_chain_units(units, decimals).parse().unwrap_or(0.0)
}

/// Lossy bridge: `f64` canonical amount to raw chain units (truncating).
pub fn decimal_to_units(amount: f64, decimals: u8) -> Result<U256, AmountError> {
    if !amount.is_finite() {
        return Err(AmountError::Malformed(amount.to_string()));
    }
    if amount < 0.0 {
        return Err(AmountError::Negative(amount.to_string()));
    }
    let rendered = format!("{amount:.prec$}", prec = decimals as usize);
    to_chain_units(&rendered, decimals)
}
