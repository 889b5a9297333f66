//! Persistence interface
//!
//! Row types of every entity the oracle reads or writes, and the
//! `OracleStore` trait a relational backend implements. `MemoryStore` is the
//! bundled implementation used by the binary and the tests.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::fixed_point::biguint_string;
use crate::types::{PoolKey, TabCode, TabStatus, BASE_CURRENCY};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Backend failure: {0}")]
    Backend(String),
}

/// Registered feed provider, mirrored from the oracle manager contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedProvider {
    pub id: Uuid,
    pub pub_address: Address,
    pub index: u64,
    pub created_datetime: DateTime<Utc>,
    pub updated_datetime: DateTime<Utc>,
    pub activated_since_block: u64,
    pub activated_timestamp: i64,
    pub disabled_since_block: u64,
    pub disabled_timestamp: i64,
    pub paused: bool,
    pub payment_term_block_count: u64,
    pub payment_token_address: Address,
    #[serde(with = "biguint_string")]
    pub payment_amount: BigUint,
    pub block_count_per_feed: u64,
    /// Minimum number of quotes a submission must carry
    pub feed_size: usize,
    /// Comma-separated IP allow-list; empty means unrestricted
    pub whitelisted_ip: String,
}

impl FeedProvider {
    pub fn new(pub_address: Address, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pub_address,
            index: 0,
            created_datetime: now,
            updated_datetime: now,
            activated_since_block: 0,
            activated_timestamp: 0,
            disabled_since_block: 0,
            disabled_timestamp: 0,
            paused: false,
            payment_term_block_count: 0,
            payment_token_address: Address::zero(),
            payment_amount: BigUint::default(),
            block_count_per_feed: 0,
            feed_size: 0,
            whitelisted_ip: String::new(),
        }
    }

    /// Disabled once a disable timestamp is set and has passed
    pub fn is_disabled_at(&self, now_secs: i64) -> bool {
        self.disabled_timestamp > 0 && now_secs > self.disabled_timestamp
    }
}

/// Hashed API token of a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRecord {
    pub id: Uuid,
    pub user_id: Address,
    pub api_token: String,
    pub created_datetime: DateTime<Utc>,
    pub updated_datetime: DateTime<Utc>,
}

/// One accepted provider request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSubmission {
    pub id: Uuid,
    pub created_datetime: DateTime<Utc>,
    pub feed_provider_id: Uuid,
    /// Provider-declared timestamp in seconds
    pub feed_timestamp: i64,
    /// Raw request body as received
    pub json_content: String,
}

/// Normalized BTC/tab rate carried by a submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePair {
    pub id: Uuid,
    pub feed_submission_id: Uuid,
    pub base_currency: String,
    pub pair_name: TabCode,
    #[serde(with = "biguint_string")]
    pub price: BigUint,
}

/// Wrapped reserve token USD rate carried by a submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedReservePrice {
    pub id: Uuid,
    pub feed_submission_id: Uuid,
    pub symbol: String,
    pub dest_currency: String,
    #[serde(with = "biguint_string")]
    pub price: BigUint,
}

/// A price row joined with the submission and provider it came from
#[derive(Debug, Clone)]
pub struct PoolRow {
    pub row_id: Uuid,
    pub submission_id: Uuid,
    pub provider_id: Uuid,
    pub provider_address: Address,
    pub submitted_at: DateTime<Utc>,
    pub key: PoolKey,
    pub price: BigUint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedianBatch {
    pub id: Uuid,
    pub created_datetime: DateTime<Utc>,
    /// Content identifier of the archived submission snapshot
    pub cid: Option<String>,
}

/// One contributing price of a median; placeholders carry no row and a zero price
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub price_pair_id: Option<Uuid>,
    #[serde(with = "biguint_string")]
    pub price: BigUint,
}

impl Slot {
    pub fn placeholder() -> Self {
        Self {
            price_pair_id: None,
            price: BigUint::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedianPrice {
    pub id: Uuid,
    pub median_batch_id: Uuid,
    pub base_currency: String,
    pub pair_name: String,
    #[serde(with = "biguint_string")]
    pub median_value: BigUint,
    pub slots: Vec<Slot>,
    /// Contributing prices, excluding placeholders
    pub active_slot: usize,
    /// `None` for wrapped reserve pools, which are not health-tracked
    pub tab_status: Option<TabStatus>,
    /// All pool values when the pool was trimmed
    pub feeds: Option<String>,
    pub refresh_median: bool,
    #[serde(with = "biguint_string")]
    pub movement_delta: BigUint,
    #[serde(with = "biguint_string")]
    pub overwritten_median: BigUint,
}

impl MedianPrice {
    /// Key the row is published under: the tab code, or the reserve symbol
    pub fn key(&self) -> &str {
        if self.base_currency == BASE_CURRENCY {
            &self.pair_name
        } else {
            &self.base_currency
        }
    }
}

/// Currently published rate of one pool key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveMedian {
    pub id: Uuid,
    pub pair_name: String,
    pub median_price_id: Uuid,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabRegistry {
    pub id: Uuid,
    pub tab_name: TabCode,
    /// `bytes3` hex of the code
    pub tab_code: String,
    pub curr_name: Option<String>,
    /// Enabled on chain, as opposed to a reference-only currency
    pub is_tab: bool,
    pub frozen: bool,
    /// De-pegged on chain
    pub is_clt_alt_del: bool,
    pub missing_count: u32,
    pub revival_count: u32,
}

impl TabRegistry {
    /// Default row for a currency seen for the first time
    pub fn new(code: TabCode) -> Self {
        Self {
            id: Uuid::new_v4(),
            tab_name: code,
            tab_code: code.to_hex(),
            curr_name: None,
            is_tab: false,
            frozen: false,
            is_clt_alt_del: false,
            missing_count: 0,
            revival_count: 0,
        }
    }
}

/// Currency whose rate is derived from another tab via a fixed ratio
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeggedTab {
    pub id: Uuid,
    pub pegged_tab: TabCode,
    pub peg_to_tab: TabCode,
    /// Percent of the source rate
    pub peg_to_ratio: u32,
}

/// One on-chain feed-count report chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPerformance {
    pub id: Uuid,
    pub created_datetime: DateTime<Utc>,
    pub provider_count: usize,
    pub providers: Vec<Address>,
    pub feed_counts: Vec<u64>,
    pub trx_ref: String,
}

/// Data store contract of the oracle core
#[async_trait]
pub trait OracleStore: Send + Sync {
    // Providers and auth
    async fn upsert_provider(&self, provider: FeedProvider) -> StoreResult<FeedProvider>;
    async fn providers(&self) -> StoreResult<Vec<FeedProvider>>;
    async fn upsert_auth(&self, user_id: Address, api_token: String) -> StoreResult<AuthRecord>;
    async fn auth_records(&self) -> StoreResult<Vec<AuthRecord>>;

    // Submissions
    async fn latest_submission(&self, provider_id: Uuid) -> StoreResult<Option<PriceSubmission>>;
    /// Write a submission with all of its rows; nothing is written on failure
    ///
    /// Fails with `Conflict` unless the feed timestamp is newer than every
    /// stored one for the same provider.
    async fn insert_submission(
        &self,
        submission: PriceSubmission,
        pairs: Vec<PricePair>,
        wrapped: Vec<WrappedReservePrice>,
    ) -> StoreResult<()>;
    async fn submission(&self, id: Uuid) -> StoreResult<Option<PriceSubmission>>;
    /// Submissions created at or after `since`
    async fn submissions_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<PriceSubmission>>;
    /// BTC/tab rows of submissions created in `(since, until]`
    async fn price_rows_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<PoolRow>>;
    /// Wrapped reserve rows of submissions created in `(since, until]`
    async fn wrapped_rows_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<PoolRow>>;
    /// A price row and the address of the provider that submitted it
    async fn price_row(&self, id: Uuid) -> StoreResult<Option<(BigUint, Address)>>;

    // Batches and medians
    async fn latest_batch(&self) -> StoreResult<Option<MedianBatch>>;
    async fn insert_batch(&self, batch: MedianBatch) -> StoreResult<MedianBatch>;
    async fn set_batch_cid(&self, batch_id: Uuid, cid: String) -> StoreResult<()>;
    async fn batch(&self, id: Uuid) -> StoreResult<Option<MedianBatch>>;
    async fn insert_median_price(&self, median: MedianPrice) -> StoreResult<MedianPrice>;
    async fn median_price(&self, id: Uuid) -> StoreResult<Option<MedianPrice>>;
    /// Median rows of one base/pair, newest batch first
    async fn median_history(
        &self,
        base_currency: &str,
        pair_name: &str,
        limit: usize,
    ) -> StoreResult<Vec<MedianPrice>>;
    async fn batch_median(
        &self,
        batch_id: Uuid,
        base_currency: &str,
        pair_name: &str,
    ) -> StoreResult<Option<MedianPrice>>;

    // Published rates
    async fn insert_active_median(&self, active: ActiveMedian) -> StoreResult<ActiveMedian>;
    async fn latest_active_median(&self, pair_name: &str) -> StoreResult<Option<ActiveMedian>>;
    async fn active_medians_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<ActiveMedian>>;

    // Tab registry
    async fn tab(&self, code: TabCode) -> StoreResult<Option<TabRegistry>>;
    async fn tabs(&self) -> StoreResult<Vec<TabRegistry>>;
    /// Create if absent, else replace the row with the same code
    async fn upsert_tab(&self, tab: TabRegistry) -> StoreResult<TabRegistry>;

    // Pegs
    async fn pegged_tabs(&self) -> StoreResult<Vec<PeggedTab>>;
    async fn pegged_tab(&self, code: TabCode) -> StoreResult<Option<PeggedTab>>;
    async fn insert_pegged_tab(&self, peg: PeggedTab) -> StoreResult<PeggedTab>;

    // Provider performance
    async fn latest_provider_performance(&self) -> StoreResult<Option<ProviderPerformance>>;
    async fn insert_provider_performance(
        &self,
        record: ProviderPerformance,
    ) -> StoreResult<ProviderPerformance>;
}
