//! Quote normalization
//!
//! Providers quote every currency against USD plus the `USDBTC` pivot. The
//! price oracle contract stores BTC/tab rates, so each quote is multiplied by
//! the BTC/USD rate derived from the pivot. Intermediate math runs at
//! `PRECISION_UNIT` digits and is scaled back to `TOKEN_DECIMALS`.

use num_bigint::BigUint;
use num_traits::Zero;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;

use crate::cache::OracleParams;
use crate::error::{OracleError, OracleResult};
use crate::fixed_point::{parse_units, pow10, PRECISION_UNIT, TOKEN_DECIMALS};
use crate::types::{TabCode, USDBTC};

/// One BTC/tab rate derived from a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPair {
    pub tab: TabCode,
    /// 18-decimal fixed point
    pub price: BigUint,
}

/// One wrapped reserve USD rate derived from a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedReserve {
    pub symbol: String,
    /// 18-decimal fixed point
    pub price: BigUint,
}

/// Tab a quote key maps to: `JPY` → JPY, `USDJPY` → JPY, `USDBTC` → USD
pub fn quote_tab(key: &str) -> OracleResult<TabCode> {
    if key.eq_ignore_ascii_case(USDBTC) {
        return Ok(TabCode::usd());
    }
    let code = match key.len() {
        3 => Some(key),
        6 => key.get(3..),
        _ => None,
    };
    code.and_then(TabCode::parse)
        .ok_or_else(|| OracleError::validation(format!("Invalid quotes item {}", key)))
}

/// Parse a quote value given as a JSON string or number
pub fn parse_quote(key: &str, value: &Value) -> OracleResult<Decimal> {
    let raw = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return Err(OracleError::validation(format!("Invalid {}", key))),
    };
    let parsed = Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map_err(|_| OracleError::validation(format!("Invalid {}", key)))?;
    if parsed.is_sign_negative() && !parsed.is_zero() {
        return Err(OracleError::validation(format!("Invalid {}", key)));
    }
    Ok(parsed)
}

fn to_units(key: &str, value: Decimal) -> OracleResult<BigUint> {
    parse_units(value, TOKEN_DECIMALS)
        .ok_or_else(|| OracleError::validation(format!("Invalid {}", key)))
}

/// BTC/USD rate at `2 × PRECISION_UNIT − TOKEN_DECIMALS` digits from the 18-digit USD/BTC pivot
pub fn btc_usd_rate(usdbtc: &BigUint) -> Option<BigUint> {
    if usdbtc.is_zero() {
        return None;
    }
    let unit = pow10(PRECISION_UNIT);
    Some(&unit * &unit / usdbtc)
}

/// BTC/USD row value: the wide BTC/USD rate scaled back to 18 digits
fn usd_row(btcusd: &BigUint) -> BigUint {
    btcusd / pow10(2 * PRECISION_UNIT - 2 * TOKEN_DECIMALS)
}

/// BTC/tab row value from an 18-digit USD/tab quote
fn tab_row(btcusd: &BigUint, quote: &BigUint) -> BigUint {
    btcusd * quote / pow10(PRECISION_UNIT + (PRECISION_UNIT - TOKEN_DECIMALS))
}

/// Normalize a full quote set; any failure rejects the whole set
pub fn normalize_quotes(quotes: &BTreeMap<String, Value>) -> OracleResult<Vec<NormalizedPair>> {
    let pivot = quotes
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(USDBTC))
        .map(|(_, v)| v)
        .ok_or_else(|| OracleError::validation("Missing USDBTC in quotes element"))?;
    let usdbtc = to_units(USDBTC, parse_quote(USDBTC, pivot)?)?;
    let btcusd = btc_usd_rate(&usdbtc).ok_or_else(|| OracleError::ZeroRate(USDBTC.to_string()))?;

    let mut seen = HashSet::new();
    let mut pairs = Vec::with_capacity(quotes.len());
    for (key, value) in quotes {
        let tab = quote_tab(key)?;
        if !seen.insert(tab) {
            return Err(OracleError::validation(format!("Duplicate quote for {}", tab)));
        }
        let quote = to_units(key, parse_quote(key, value)?)?;
        let price = if key.eq_ignore_ascii_case(USDBTC) {
            usd_row(&btcusd)
        } else {
            tab_row(&btcusd, &quote)
        };
        if price.is_zero() {
            tracing::warn!(key = %key, tab = %tab, "Zero rate from quote normalization");
            return Err(OracleError::ZeroRate(key.clone()));
        }
        pairs.push(NormalizedPair { tab, price });
    }
    Ok(pairs)
}

/// Normalize wrapped reserve USD quotes; only configured symbols are accepted
pub fn normalize_wrapped_reserves(
    reserves: &BTreeMap<String, Value>,
    params: &OracleParams,
) -> OracleResult<Vec<NormalizedReserve>> {
    reserves
        .iter()
        .map(|(key, value)| {
            let symbol = key.to_uppercase();
            if !params.is_wrapped_reserve(&symbol) {
                return Err(OracleError::validation(format!(
                    "Invalid wrapped reserve {}",
                    key
                )));
            }
            let price = to_units(key, parse_quote(key, value)?)?;
            if price.is_zero() {
                return Err(OracleError::ZeroRate(key.clone()));
            }
            Ok(NormalizedReserve { symbol, price })
        })
        .collect()
}
