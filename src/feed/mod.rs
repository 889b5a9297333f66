//! Provider feed intake
//!
//! - `normalizer`: raw decimal quotes → fixed-point BTC/tab rates
//! - `submission`: provider checks and atomic persistence of a submission

pub mod normalizer;
pub mod submission;

pub use normalizer::*;
pub use submission::*;

use ethers::types::Address;
use serde::{Deserialize, Deserializer};
use serde_json::value::RawValue;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{OracleError, OracleResult};

/// Request body of a provider submission or token reset
///
/// `data` is kept verbatim: the provider signature covers its exact bytes.
#[derive(Debug, Deserialize)]
pub struct FeedEnvelope {
    pub data: Box<RawValue>,
    pub signature: String,
}

impl FeedEnvelope {
    pub fn parse(body: &str) -> OracleResult<Self> {
        serde_json::from_str(body)
            .map_err(|e| OracleError::validation(format!("Invalid JSON body: {}", e)))
    }

    /// Raw `data` JSON as signed by the provider
    pub fn signed_payload(&self) -> &str {
        self.data.get()
    }

    pub fn feed(&self) -> OracleResult<FeedData> {
        serde_json::from_str(self.data.get())
            .map_err(|e| OracleError::validation(format!("Invalid data element: {}", e)))
    }
}

/// `data` element of a submission
#[derive(Debug, Clone, Deserialize)]
pub struct FeedData {
    pub provider: Address,
    /// Provider-declared time in seconds
    #[serde(deserialize_with = "de_timestamp")]
    pub timestamp: i64,
    #[serde(default)]
    pub quotes: BTreeMap<String, Value>,
    /// Wrapped reserve token → USD quotes, keyed by token symbol
    #[serde(default)]
    pub wrapped_reserves: BTreeMap<String, Value>,
}

/// Request metadata forwarded by the HTTP layer
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// `x-real-ip` header
    pub real_ip: Option<String>,
    /// `x-api-token` header
    pub api_token: Option<String>,
}

/// Accepts integers and integer strings
fn de_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom("timestamp must be an integer")),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| serde::de::Error::custom("timestamp must be an integer")),
        _ => Err(serde::de::Error::custom("timestamp must be an integer")),
    }
}
