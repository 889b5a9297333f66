//! Provider authentication
//!
//! API tokens are random hex strings; only `base64(HMAC-SHA256(secret, token))`
//! is stored. Submissions are additionally bound to the provider by an
//! EIP-191 signature over the raw `data` JSON and an optional IP allow-list.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use ethers::types::{Address, Signature};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::str::FromStr;

use crate::error::{OracleError, OracleResult};
use crate::feed::{FeedEnvelope, RequestMeta};
use crate::store::FeedProvider;

type HmacSha256 = Hmac<Sha256>;

pub const AUTH_ERROR: &str = "Authentication failed";
/// Maximum age in seconds of a token reset request
pub const RESET_MAX_AGE_SECS: i64 = 4;

/// Issues, hashes and verifies API tokens
#[derive(Clone)]
pub struct ApiTokenCodec {
    keyed: HmacSha256,
}

impl ApiTokenCodec {
    pub fn new(secret: &str) -> OracleResult<Self> {
        if secret.is_empty() {
            return Err(OracleError::Unauthorized("empty auth secret".to_string()));
        }
        let keyed = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| OracleError::Unauthorized(format!("invalid auth secret: {}", e)))?;
        Ok(Self { keyed })
    }

    fn mac(&self, token: &str) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(token.as_bytes());
        mac
    }

    /// New random token, 32 bytes hex encoded
    pub fn issue(&self) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Stored form of a token
    pub fn hash(&self, token: &str) -> String {
        general_purpose::STANDARD.encode(self.mac(token).finalize().into_bytes())
    }

    /// Constant-time check of a presented token against its stored hash
    pub fn verify(&self, token: &str, stored: &str) -> bool {
        if token.is_empty() || stored.is_empty() {
            return false;
        }
        match general_purpose::STANDARD.decode(stored) {
            Ok(expected) => self.mac(token).verify_slice(&expected).is_ok(),
            Err(_) => false,
        }
    }
}

/// Whether any `x-real-ip` entry is on the comma-separated allow-list
pub fn ip_allowed(real_ip: &str, whitelist: &str) -> bool {
    let allowed: Vec<&str> = whitelist
        .split(',')
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .collect();
    if allowed.is_empty() {
        return true;
    }
    real_ip
        .split(',')
        .map(str::trim)
        .any(|ip| allowed.contains(&ip))
}

fn check_ip(meta: &RequestMeta, provider: &FeedProvider) -> OracleResult<()> {
    let real_ip = meta
        .real_ip
        .as_deref()
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| OracleError::validation("Required x-real-ip header"))?;
    if !ip_allowed(real_ip, &provider.whitelisted_ip) {
        tracing::warn!(
            ip = %real_ip,
            provider = %format!("{:#x}", provider.pub_address),
            "Blocked access from unlisted IP"
        );
        return Err(OracleError::Unauthorized("Unauthorized IP address".to_string()));
    }
    Ok(())
}

/// Address that produced an EIP-191 signature over `payload`
pub fn recover_signer(payload: &str, signature: &str) -> OracleResult<Address> {
    let signature = Signature::from_str(signature.trim_start_matches("0x"))
        .map_err(|_| OracleError::validation("Invalid signature"))?;
    signature
        .recover(payload)
        .map_err(|_| OracleError::validation("Invalid signature"))
}

/// Bind a request body to its provider: IP allow-list, provider field and signature
pub fn validate_submission(
    meta: &RequestMeta,
    envelope: &FeedEnvelope,
    provider: &FeedProvider,
) -> OracleResult<()> {
    check_ip(meta, provider)?;

    #[derive(Deserialize)]
    struct ProviderField {
        provider: Address,
    }
    let claimed: ProviderField = serde_json::from_str(envelope.signed_payload())
        .map_err(|_| OracleError::validation("Required provider on JSON body data element"))?;
    if claimed.provider != provider.pub_address {
        return Err(OracleError::validation("Unmatched provider address"));
    }

    if recover_signer(envelope.signed_payload(), &envelope.signature)? != provider.pub_address {
        return Err(OracleError::validation("Invalid signature"));
    }
    Ok(())
}

/// Token reset requests must be fresh: not older than `RESET_MAX_AGE_SECS`, not in the future
pub fn check_reset_timestamp(timestamp: i64, now: DateTime<Utc>) -> OracleResult<()> {
    let elapsed = now.timestamp() - timestamp;
    if !(0..=RESET_MAX_AGE_SECS).contains(&elapsed) {
        return Err(OracleError::validation("Invalid data.timestamp value"));
    }
    Ok(())
}

/// Freshly issued token; the plain value is only ever returned here
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub provider: Address,
    pub api_token: String,
}
