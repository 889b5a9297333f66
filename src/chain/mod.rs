//! Blockchain collaborators
//!
//! The oracle reads provider and tab state from the oracle manager and tab
//! registry contracts, writes tab enable/disable and feed-count reports, and
//! reads attestation nonces from the price oracle contract. Each concern is a
//! trait so the aggregation core can run against fakes.

pub mod ethers_client;

pub use ethers_client::EthersChain;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use thiserror::Error;

use crate::types::TabCode;

/// Number of providers reported per `submitProviderFeedCount` call
pub const FEED_COUNT_CHUNK: usize = 10;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Chain configuration error: {0}")]
    Config(String),

    #[error("Contract call {call} failed: {reason}")]
    Call { call: String, reason: String },

    #[error("Transaction {call} was not confirmed: {reason}")]
    Transaction { call: String, reason: String },
}

impl ChainError {
    pub fn call(call: impl Into<String>, reason: impl ToString) -> Self {
        ChainError::Call {
            call: call.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transaction(call: impl Into<String>, reason: impl ToString) -> Self {
        ChainError::Transaction {
            call: call.into(),
            reason: reason.to_string(),
        }
    }
}

pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// `providers(address)` of the oracle manager
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderStatus {
    pub index: u64,
    pub activated_since_block: u64,
    pub activated_timestamp: i64,
    pub disabled_since_block: u64,
    pub disabled_timestamp: i64,
    pub paused: bool,
}

impl ProviderStatus {
    /// Not disabled, not paused and past its activation time
    pub fn is_active_at(&self, now_secs: i64) -> bool {
        self.disabled_since_block == 0
            && self.disabled_timestamp == 0
            && !self.paused
            && now_secs >= self.activated_timestamp
    }
}

/// `providerInfo(address)` of the oracle manager
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderInfo {
    pub payment_term_block_count: u64,
    pub payment_token_address: Address,
    pub payment_amount: U256,
    pub block_count_per_feed: u64,
    pub feed_size: u64,
    /// Decoded `bytes32` string
    pub whitelisted_ip: String,
}

/// Per-tab risk configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TabParams {
    pub risk_penalty_per_frame: u64,
    pub process_fee_rate: u64,
    pub min_reserve_ratio: u64,
    pub liquidation_ratio: u64,
}

/// Side-effect-free contract reads
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn provider_addresses(&self) -> ChainResult<Vec<Address>>;
    async fn provider_status(&self, provider: Address) -> ChainResult<ProviderStatus>;
    async fn provider_info(&self, provider: Address) -> ChainResult<ProviderInfo>;
    async fn activated_tabs(&self) -> ChainResult<Vec<TabCode>>;
    async fn is_frozen(&self, tab: TabCode) -> ChainResult<bool>;
    /// Tabs de-pegged through the ctrl-alt-del flow
    async fn depegged_tabs(&self) -> ChainResult<Vec<TabCode>>;
    async fn tab_params(&self, tab: TabCode) -> ChainResult<TabParams>;
}

/// Keeper transactions; each call returns once the transaction is confirmed
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainWriter: Send + Sync {
    async fn enable_tab(&self, tab: TabCode) -> ChainResult<H256>;
    async fn disable_tab(&self, tab: TabCode) -> ChainResult<H256>;
    async fn submit_provider_feed_count(
        &self,
        providers: [Address; FEED_COUNT_CHUNK],
        feed_counts: [U256; FEED_COUNT_CHUNK],
        timestamp: U256,
    ) -> ChainResult<H256>;
}

/// Attestation nonces of the price oracle contract
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NonceSource: Send + Sync {
    async fn nonce_of(&self, user: Address) -> ChainResult<U256>;
}
