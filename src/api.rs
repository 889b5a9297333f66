//! Service facade and response envelope
//!
//! Every public operation returns an `ApiResponse`: `{timestamp, data}` on
//! success or `{timestamp, data: {error}}` on failure, tagged with a status
//! class the HTTP layer maps onto a response code. Internal faults are logged
//! and reported generically.

use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::attestation::{AttestationService, SignedQuotes};
use crate::auth::{check_reset_timestamp, validate_submission, ApiTokenCodec, IssuedToken, AUTH_ERROR};
use crate::cache::{ParamsCache, ProviderSummary};
use crate::error::{OracleError, OracleResult};
use crate::feed::{save_feeds, FeedEnvelope, RequestMeta, SubmissionReceipt};
use crate::query::{self, History, LiveQuery, LiveQuotes, TabSummary};
use crate::store::OracleStore;

pub const INTERNAL_ERROR: &str = "Internal server error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusClass {
    Ok,
    BadRequest,
    Unauthorized,
    NoData,
    Internal,
}

impl StatusClass {
    pub fn http_status(&self) -> u16 {
        match self {
            StatusClass::Ok => 200,
            StatusClass::BadRequest => 400,
            StatusClass::Unauthorized => 401,
            StatusClass::NoData => 404,
            StatusClass::Internal => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ApiData<T> {
    Ok(T),
    Error(ErrorBody),
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub timestamp: i64,
    pub data: ApiData<T>,
    #[serde(skip)]
    pub status: StatusClass,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, timestamp: i64) -> Self {
        Self {
            timestamp,
            data: ApiData::Ok(data),
            status: StatusClass::Ok,
        }
    }

    pub fn error(err: &OracleError, timestamp: i64) -> Self {
        let (status, message) = if err.is_internal() {
            tracing::error!(error = %err, "Request failed");
            (StatusClass::Internal, INTERNAL_ERROR.to_string())
        } else {
            match err {
                OracleError::Unauthorized(reason) => {
                    tracing::warn!(reason = %reason, "Request rejected");
                    (StatusClass::Unauthorized, AUTH_ERROR.to_string())
                }
                OracleError::NoData(_) => (StatusClass::NoData, err.to_string()),
                _ => (StatusClass::BadRequest, err.to_string()),
            }
        };
        Self {
            timestamp,
            data: ApiData::Error(ErrorBody { error: message }),
            status,
        }
    }

    /// Envelope stamped with `now` in seconds
    pub fn from_result(result: OracleResult<T>, now: DateTime<Utc>) -> Self {
        match result {
            Ok(data) => Self::ok(data, now.timestamp()),
            Err(e) => Self::error(&e, now.timestamp()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == StatusClass::Ok
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.data {
            ApiData::Error(body) => Some(&body.error),
            ApiData::Ok(_) => None,
        }
    }
}

/// Entry points handed to the HTTP layer
pub struct OracleService {
    store: Arc<dyn OracleStore>,
    cache: Arc<ParamsCache>,
    codec: ApiTokenCodec,
    /// Hashed token guarding the private read endpoints
    private_token: String,
    attestation: AttestationService,
}

impl OracleService {
    pub fn new(
        store: Arc<dyn OracleStore>,
        cache: Arc<ParamsCache>,
        codec: ApiTokenCodec,
        private_token: String,
        attestation: AttestationService,
    ) -> Self {
        Self {
            store,
            cache,
            codec,
            private_token,
            attestation,
        }
    }

    fn check_private_token(&self, meta: &RequestMeta) -> OracleResult<()> {
        let token = meta.api_token.as_deref().unwrap_or_default();
        if !self.codec.verify(token, &self.private_token) {
            return Err(OracleError::Unauthorized("invalid private token".to_string()));
        }
        Ok(())
    }

    async fn issue_token(
        &self,
        provider: Address,
        meta: &RequestMeta,
        body: &str,
        now: DateTime<Utc>,
    ) -> OracleResult<IssuedToken> {
        let cached = self
            .cache
            .provider(provider)
            .await
            .ok_or_else(|| OracleError::validation("Provider is not found"))?;
        let envelope = FeedEnvelope::parse(body)?;
        validate_submission(meta, &envelope, &cached.provider)?;
        check_reset_timestamp(envelope.feed()?.timestamp, now)?;

        let api_token = self.codec.issue();
        let record = self
            .store
            .upsert_auth(provider, self.codec.hash(&api_token))
            .await?;
        self.cache.set_auth(record).await;
        tracing::info!(provider = %format!("{:#x}", provider), "API token reset");
        Ok(IssuedToken {
            provider,
            api_token,
        })
    }

    /// Issue a new API token to a registered provider, replacing any previous one
    pub async fn reset_api_token(
        &self,
        provider: Address,
        meta: &RequestMeta,
        body: &str,
        now: DateTime<Utc>,
    ) -> ApiResponse<IssuedToken> {
        ApiResponse::from_result(self.issue_token(provider, meta, body, now).await, now)
    }

    async fn accept_feed(
        &self,
        provider: Address,
        meta: &RequestMeta,
        body: &str,
        now: DateTime<Utc>,
    ) -> OracleResult<SubmissionReceipt> {
        if self.cache.is_stale(now).await {
            tracing::warn!("Params cache is stale");
        }
        let cached = self
            .cache
            .provider(provider)
            .await
            .ok_or_else(|| OracleError::Unauthorized("unknown provider".to_string()))?;
        let stored = cached
            .auth
            .as_ref()
            .ok_or_else(|| OracleError::Unauthorized("no API token issued".to_string()))?;
        let token = meta.api_token.as_deref().unwrap_or_default();
        if !self.codec.verify(token, &stored.api_token) {
            return Err(OracleError::Unauthorized("invalid API token".to_string()));
        }

        let envelope = FeedEnvelope::parse(body)?;
        validate_submission(meta, &envelope, &cached.provider)?;
        let feed = envelope.feed()?;
        save_feeds(
            self.store.as_ref(),
            self.cache.params(),
            &cached.provider,
            &feed,
            body,
            now,
        )
        .await
    }

    /// Authenticated provider submission
    pub async fn submit_feed(
        &self,
        provider: Address,
        meta: &RequestMeta,
        body: &str,
        now: DateTime<Utc>,
    ) -> ApiResponse<SubmissionReceipt> {
        ApiResponse::from_result(self.accept_feed(provider, meta, body, now).await, now)
    }

    pub async fn tab_list(&self, now: DateTime<Utc>) -> ApiResponse<Vec<TabSummary>> {
        ApiResponse::from_result(query::tab_list(self.store.as_ref()).await, now)
    }

    /// Live quotes; requires the private token. Stamped in milliseconds.
    pub async fn live_quotes(
        &self,
        meta: &RequestMeta,
        live: &LiveQuery,
        now: DateTime<Utc>,
    ) -> ApiResponse<LiveQuotes> {
        let result = match self.check_private_token(meta) {
            Ok(()) => query::live_quotes(self.store.as_ref(), &self.cache, live, now).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(quotes) => ApiResponse::ok(quotes, now.timestamp_millis()),
            Err(e) => ApiResponse::error(&e, now.timestamp()),
        }
    }

    /// Median history; `reserve_symbol` defaults to the configured reserve
    pub async fn history(
        &self,
        curr: &str,
        limit: Option<usize>,
        reserve_symbol: Option<&str>,
        now: DateTime<Utc>,
    ) -> ApiResponse<History> {
        let reserve = reserve_symbol.unwrap_or(self.cache.params().default_reserve_symbol.as_str());
        ApiResponse::from_result(
            query::history(self.store.as_ref(), curr, limit, reserve).await,
            now,
        )
    }

    /// Provider directory; requires the private token
    pub async fn provider_list(
        &self,
        meta: &RequestMeta,
        now: DateTime<Utc>,
    ) -> ApiResponse<BTreeMap<String, ProviderSummary>> {
        let result = match self.check_private_token(meta) {
            Ok(()) => Ok(query::provider_directory(&self.cache).await),
            Err(e) => Err(e),
        };
        ApiResponse::from_result(result, now)
    }

    /// Signed price for an updater; stamped with the publication time of the rate
    pub async fn signed_median_price(
        &self,
        updater: Address,
        curr: &str,
        reserve_symbol: Option<&str>,
        now: DateTime<Utc>,
    ) -> ApiResponse<SignedQuotes> {
        match self
            .attestation
            .signed_median_price(updater, curr, reserve_symbol)
            .await
        {
            Ok(signed) => {
                let timestamp = signed.timestamp;
                ApiResponse::ok(signed, timestamp)
            }
            Err(e) => ApiResponse::error(&e, now.timestamp()),
        }
    }
}
