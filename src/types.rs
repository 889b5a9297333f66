//! Core types used throughout the oracle
//!
//! Currency codes, tab health status and the keys price pools are grouped by.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Reserve asset every tab rate is quoted against
pub const BASE_CURRENCY: &str = "BTC";
/// Currency wrapped reserve tokens are quoted in
pub const WRAPPED_DEST_CURRENCY: &str = "USD";
/// Quote key carrying the USD/BTC pivot rate
pub const USDBTC: &str = "USDBTC";
pub const USD: &str = "USD";

/// Three-letter currency code, the off-chain view of the on-chain `bytes3`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabCode([u8; 3]);

impl TabCode {
    /// Parse from string, upper-casing it. Only 3 ASCII letters are accepted.
    pub fn parse(s: &str) -> Option<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_alphabetic()) {
            return None;
        }
        let mut code = [0u8; 3];
        for (dst, src) in code.iter_mut().zip(bytes) {
            *dst = src.to_ascii_uppercase();
        }
        Some(Self(code))
    }

    /// Parse the raw `bytes3` returned by the tab registry contract
    pub fn from_bytes(bytes: [u8; 3]) -> Option<Self> {
        Self::parse(std::str::from_utf8(&bytes).ok()?)
    }

    /// Lenient form used by read endpoints: the first 3 characters, upper-cased
    pub fn from_request(s: &str) -> Option<Self> {
        Self::parse(s.get(..3)?)
    }

    pub fn as_bytes(&self) -> [u8; 3] {
        self.0
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or_default()
    }

    /// `0x`-prefixed hex of the `bytes3` value
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn usd() -> Self {
        Self(*b"USD")
    }

    pub fn is_usd(&self) -> bool {
        &self.0 == b"USD"
    }
}

impl fmt::Display for TabCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TabCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TabCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        TabCode::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid tab code '{}'", raw)))
    }
}

/// Per-batch availability status of a currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TabStatus {
    #[serde(rename = "A")]
    Active,
    #[serde(rename = "R")]
    Recovering,
    #[serde(rename = "F")]
    Frozen,
    #[serde(rename = "M")]
    Missing,
}

impl TabStatus {
    /// Single-letter code persisted with each median row
    pub fn code(&self) -> char {
        match self {
            TabStatus::Active => 'A',
            TabStatus::Recovering => 'R',
            TabStatus::Frozen => 'F',
            TabStatus::Missing => 'M',
        }
    }
}

impl Default for TabStatus {
    fn default() -> Self {
        TabStatus::Active
    }
}

impl fmt::Display for TabStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TabStatus::Active => write!(f, "ACTIVE"),
            TabStatus::Recovering => write!(f, "RECOVERING"),
            TabStatus::Frozen => write!(f, "FROZEN"),
            TabStatus::Missing => write!(f, "MISSING"),
        }
    }
}

/// Identifies one price pool within a batch
///
/// Tab pools hold BTC/tab rates; reserve pools hold wrapped-reserve/USD rates
/// keyed by the token symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PoolKey {
    Tab(TabCode),
    Reserve(String),
}

impl PoolKey {
    /// Key the active median of this pool is published under
    pub fn name(&self) -> &str {
        match self {
            PoolKey::Tab(code) => code.as_str(),
            PoolKey::Reserve(symbol) => symbol,
        }
    }

    pub fn base_currency(&self) -> &str {
        match self {
            PoolKey::Tab(_) => BASE_CURRENCY,
            PoolKey::Reserve(symbol) => symbol,
        }
    }

    pub fn pair_name(&self) -> &str {
        match self {
            PoolKey::Tab(code) => code.as_str(),
            PoolKey::Reserve(_) => WRAPPED_DEST_CURRENCY,
        }
    }

    pub fn tab(&self) -> Option<TabCode> {
        match self {
            PoolKey::Tab(code) => Some(*code),
            PoolKey::Reserve(_) => None,
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tab_code_parses_and_uppercases() {
        let code = TabCode::parse("jpy").unwrap();
        assert_eq!(code.as_str(), "JPY");
        assert_eq!(code.to_hex(), "0x4a5059");
        assert!(TabCode::parse("JP").is_none());
        assert!(TabCode::parse("JPYX").is_none());
        assert!(TabCode::parse("J1Y").is_none());
    }

    #[test]
    fn tab_code_from_request_truncates() {
        assert_eq!(TabCode::from_request("usdt").unwrap().as_str(), "USD");
        assert!(TabCode::from_request("us").is_none());
    }

    #[test]
    fn tab_code_serde_as_string() {
        let code = TabCode::parse("EUR").unwrap();
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, "\"EUR\"");
        let back: TabCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
        assert!(serde_json::from_str::<TabCode>("\"EURO\"").is_err());
    }

    #[test]
    fn pool_key_naming() {
        let tab = PoolKey::Tab(TabCode::parse("MYR").unwrap());
        assert_eq!(tab.base_currency(), "BTC");
        assert_eq!(tab.pair_name(), "MYR");

        let reserve = PoolKey::Reserve("CBBTC".to_string());
        assert_eq!(reserve.name(), "CBBTC");
        assert_eq!(reserve.base_currency(), "CBBTC");
        assert_eq!(reserve.pair_name(), "USD");
        assert!(reserve.tab().is_none());
    }

    #[test]
    fn status_codes() {
        assert_eq!(TabStatus::Frozen.code(), 'F');
        assert_eq!(serde_json::to_string(&TabStatus::Recovering).unwrap(), "\"R\"");
    }
}
