//! Signed price attestations
//!
//! Resolves the published BTC/tab rate (directly or through a peg), converts
//! it into a wrapped-reserve/tab price and signs it for on-chain submission
//! by the requesting updater.

pub mod signing;

pub use signing::{sign_update_price, update_price_typed_data, SignedPrice, UpdatePriceData};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, U256};
use num_bigint::BigUint;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::aggregation::{current_rate, resolve_pegged_rate};
use crate::cache::OracleParams;
use crate::chain::NonceSource;
use crate::error::{OracleError, OracleResult};
use crate::fixed_point::{adjusted_reserve_price, to_u256};
use crate::store::OracleStore;
use crate::types::{TabCode, BASE_CURRENCY, USD};

/// One signed quote
#[derive(Debug, Clone, Serialize)]
pub struct SignedQuote {
    #[serde(rename = "reserveSymbol")]
    pub reserve_symbol: String,
    /// Wrapped reserve → tab price that was signed
    pub median: String,
    #[serde(rename = "btcToTab")]
    pub btc_to_tab: String,
    pub signed: SignedPrice,
}

/// Attestation result; `timestamp` is the publication time of the rate in ms
#[derive(Debug, Clone, Serialize)]
pub struct SignedQuotes {
    #[serde(skip)]
    pub timestamp: i64,
    pub quotes: BTreeMap<String, SignedQuote>,
}

pub struct AttestationService {
    store: Arc<dyn OracleStore>,
    nonces: Arc<dyn NonceSource>,
    signer: LocalWallet,
    chain_id: u64,
    price_oracle: Address,
    default_reserve_symbol: String,
}

impl AttestationService {
    pub fn new(
        store: Arc<dyn OracleStore>,
        nonces: Arc<dyn NonceSource>,
        signer_private_key: &str,
        chain_id: u64,
        price_oracle: &str,
        params: &OracleParams,
    ) -> OracleResult<Self> {
        let signer: LocalWallet = signer_private_key
            .parse()
            .map_err(|_| OracleError::Signing("invalid signer private key".to_string()))?;
        let price_oracle: Address = price_oracle
            .parse()
            .map_err(|_| OracleError::Signing(format!("invalid price oracle address {}", price_oracle)))?;
        Ok(Self {
            store,
            nonces,
            signer: signer.with_chain_id(chain_id),
            chain_id,
            price_oracle,
            default_reserve_symbol: params.default_reserve_symbol.clone(),
        })
    }

    /// Address of the signing owner
    pub fn owner(&self) -> Address {
        self.signer.address()
    }

    /// Published BTC/tab rate and its publication time, falling back to the peg
    async fn tab_rate(&self, code: TabCode) -> OracleResult<(BigUint, i64)> {
        let store = self.store.as_ref();
        if let Some((active, median)) = current_rate(store, code.as_str()).await? {
            return Ok((median.median_value, active.last_updated.timestamp_millis()));
        }
        match resolve_pegged_rate(store, code).await? {
            Some(pegged) => Ok((pegged.rate, pegged.source.last_updated.timestamp_millis())),
            None => Err(OracleError::no_data("No data")),
        }
    }

    /// Signed wrapped-reserve price of `curr` for `updater`
    pub async fn signed_median_price(
        &self,
        updater: Address,
        curr: &str,
        reserve_symbol: Option<&str>,
    ) -> OracleResult<SignedQuotes> {
        let code = TabCode::from_request(curr)
            .ok_or_else(|| OracleError::validation(format!("Invalid currency {}", curr)))?;
        let reserve = reserve_symbol
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_uppercase)
            .unwrap_or_else(|| self.default_reserve_symbol.clone());

        let (btc_to_tab, timestamp) = self.tab_rate(code).await?;

        let store = self.store.as_ref();
        let (_, wrapped) = current_rate(store, &reserve).await?.ok_or_else(|| {
            OracleError::no_data(format!("No wrapped BTC reserve token: {}", reserve))
        })?;
        let btc_to_usd = if code.is_usd() {
            btc_to_tab.clone()
        } else {
            current_rate(store, USD)
                .await?
                .map(|(_, median)| median.median_value)
                .ok_or_else(|| OracleError::no_data("No BTC/USD rate"))?
        };

        let price = adjusted_reserve_price(&wrapped.median_value, &btc_to_usd, &btc_to_tab)
            .ok_or_else(|| OracleError::ZeroRate(USD.to_string()))?;
        let price_word = to_u256(&price)
            .ok_or_else(|| OracleError::Signing("price exceeds uint256".to_string()))?;
        let nonce = self.nonces.nonce_of(updater).await?;

        let data = UpdatePriceData {
            owner: self.signer.address(),
            updater,
            tab: code,
            price: price_word,
            timestamp: U256::from(timestamp.max(0) as u64),
            nonce,
        };
        let signed = sign_update_price(&self.signer, &data, self.chain_id, self.price_oracle).await?;
        tracing::info!(
            tab = %code,
            reserve = %reserve,
            updater = %format!("{:#x}", updater),
            nonce = %nonce,
            "Signed median price"
        );

        let mut quotes = BTreeMap::new();
        quotes.insert(
            format!("{}{}", BASE_CURRENCY, code),
            SignedQuote {
                reserve_symbol: reserve,
                median: price.to_string(),
                btc_to_tab: btc_to_tab.to_string(),
                signed,
            },
        );
        Ok(SignedQuotes { timestamp, quotes })
    }
}
