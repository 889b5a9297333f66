//! Fixed-point arithmetic on arbitrary-precision integers
//!
//! On-chain rates carry `TOKEN_DECIMALS` fractional digits. The quote
//! normalizer works at `PRECISION_UNIT` digits (token decimals plus a 12 digit
//! buffer) so that the chained divide/multiply steps do not truncate early;
//! the buffer is divided back out before a rate is stored.

use ethers::types::U256;
use num_bigint::BigUint;
use num_traits::Zero;
use rust_decimal::Decimal;

/// Fractional digits of every stored rate
pub const TOKEN_DECIMALS: u32 = 18;
/// Fractional digits used while normalizing quotes
pub const PRECISION_UNIT: u32 = TOKEN_DECIMALS + 12;
/// Fractional digits of the intermediate wrapped-reserve adjustment (1e28)
pub const ADJUSTMENT_DIGITS: u32 = 28;
/// Peg ratios are expressed in percent
pub const PEG_RATIO_BASE: u32 = 100;
/// Movement delta config is expressed in 1/10000 of a percent point
pub const MOVEMENT_DELTA_BASE: u32 = 10_000;

pub fn pow10(exp: u32) -> BigUint {
    BigUint::from(10u32).pow(exp)
}

/// 1.0 at `TOKEN_DECIMALS`
pub fn scale() -> BigUint {
    pow10(TOKEN_DECIMALS)
}

/// Convert a decimal into an integer with `decimals` fractional digits.
///
/// Digits beyond `decimals` are truncated. Negative values yield `None`.
pub fn parse_units(value: Decimal, decimals: u32) -> Option<BigUint> {
    if value.is_sign_negative() && !value.is_zero() {
        return None;
    }
    let mantissa = BigUint::from(value.mantissa().unsigned_abs());
    let digits = value.scale();
    Some(if digits <= decimals {
        mantissa * pow10(decimals - digits)
    } else {
        mantissa / pow10(digits - decimals)
    })
}

/// Render an integer with `decimals` fractional digits as a decimal string
pub fn format_units(value: &BigUint, decimals: u32) -> String {
    let divisor = pow10(decimals);
    let whole = value / &divisor;
    let frac = value % &divisor;
    if frac.is_zero() {
        return whole.to_string();
    }
    let frac = format!("{:0>width$}", frac.to_string(), width = decimals as usize);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

/// Wrapped reserve → tab rate.
///
/// `wrapped_to_usd × 1e28 / btc_to_usd × btc_to_tab / 1e28`, or the wrapped
/// USD rate itself when the tab rate is the BTC/USD rate. `None` when the
/// BTC/USD rate is zero.
pub fn adjusted_reserve_price(
    wrapped_to_usd: &BigUint,
    btc_to_usd: &BigUint,
    btc_to_tab: &BigUint,
) -> Option<BigUint> {
    if btc_to_usd == btc_to_tab {
        return Some(wrapped_to_usd.clone());
    }
    if btc_to_usd.is_zero() {
        return None;
    }
    let precision = pow10(ADJUSTMENT_DIGITS);
    Some(wrapped_to_usd * &precision / btc_to_usd * btc_to_tab / precision)
}

/// Absolute price movement in percent at `TOKEN_DECIMALS`.
///
/// `|new − old| × 1e18 / old × 100`; `None` when `old` is zero.
pub fn movement_delta(old: &BigUint, new: &BigUint) -> Option<BigUint> {
    if old.is_zero() {
        return None;
    }
    let diff = if new >= old { new - old } else { old - new };
    Some(diff * scale() / old * BigUint::from(100u32))
}

/// Threshold a movement delta must exceed, from the `movement_delta` config
pub fn movement_threshold(movement_delta_config: u64) -> BigUint {
    BigUint::from(movement_delta_config) * scale() / BigUint::from(MOVEMENT_DELTA_BASE)
}

/// Rate of a pegged currency from its source rate and percent ratio
pub fn pegged_rate(source: &BigUint, peg_ratio: u32) -> BigUint {
    source * BigUint::from(peg_ratio) / BigUint::from(PEG_RATIO_BASE)
}

/// Narrow to the on-chain word size; `None` when the value needs more than 256 bits
pub fn to_u256(value: &BigUint) -> Option<U256> {
    let bytes = value.to_bytes_be();
    if bytes.len() > 32 {
        return None;
    }
    Some(U256::from_big_endian(&bytes))
}

pub fn from_u256(value: U256) -> BigUint {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    BigUint::from_bytes_be(&bytes)
}

/// Serde helper storing big integers as decimal strings
pub mod biguint_string {
    use num_bigint::BigUint;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<BigUint>().map_err(serde::de::Error::custom)
    }
}
