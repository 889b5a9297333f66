//! Read surface
//!
//! Tab list, live published quotes, per-currency median history and the
//! provider directory.

use chrono::{DateTime, Duration, Utc};
use ethers::types::Address;
use num_bigint::BigUint;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::cache::{ParamsCache, ProviderSummary};
use crate::chain::TabParams;
use crate::error::{OracleError, OracleResult};
use crate::fixed_point::{adjusted_reserve_price, scale};
use crate::store::{ActiveMedian, MedianPrice, OracleStore, TabRegistry};
use crate::types::{TabCode, TabStatus, BASE_CURRENCY, USD, WRAPPED_DEST_CURRENCY};

pub const DEFAULT_HISTORY_LIMIT: usize = 10;
pub const MAX_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TabSummary {
    pub code: TabCode,
    pub bytes3: String,
    pub name: Option<String>,
    pub activated: bool,
    pub frozen: bool,
    #[serde(rename = "cltAltDel")]
    pub clt_alt_del: bool,
}

/// Every registered currency ordered by code
pub async fn tab_list(store: &dyn OracleStore) -> OracleResult<Vec<TabSummary>> {
    let mut tabs = store.tabs().await?;
    tabs.sort_by_key(|t| t.tab_name);
    Ok(tabs
        .into_iter()
        .map(|t| TabSummary {
            code: t.tab_name,
            bytes3: t.tab_code,
            name: t.curr_name,
            activated: t.is_tab,
            frozen: t.frozen,
            clt_alt_del: t.is_clt_alt_del,
        })
        .collect())
}

/// Options of a live quote request
#[derive(Debug, Clone, Default)]
pub struct LiveQuery {
    pub details: bool,
    pub tab_only: bool,
    /// Currency filter; USD and the wrapped reserves are always included
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TabInfo {
    pub tab_code: String,
    pub tab_name: TabCode,
    pub currency_name: Option<String>,
    pub is_clt_alt_del: bool,
    pub is_tab: bool,
    pub missing_count: u32,
    pub revival_count: u32,
    pub frozen: bool,
    pub risk_penalty_per_frame: u64,
    pub process_fee_rate: u64,
    pub min_reserve_ratio: u64,
    pub liquidation_ratio: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuoteDetail {
    pub provider: Address,
    pub quote: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveQuote {
    pub tab: TabInfo,
    pub median: String,
    /// Milliseconds
    pub last_updated: i64,
    pub cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<QuoteDetail>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReserveQuote {
    pub median: String,
    pub last_updated: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveQuotes {
    pub popular_tabs: Vec<String>,
    #[serde(rename = "wrapped_BTC_tokens")]
    pub wrapped_btc_tokens: BTreeMap<String, ReserveQuote>,
    pub quotes: BTreeMap<String, LiveQuote>,
}

/// Latest active median per key among the rows published recently enough
fn latest_per_key(rows: Vec<ActiveMedian>) -> BTreeMap<String, ActiveMedian> {
    let mut latest: BTreeMap<String, ActiveMedian> = BTreeMap::new();
    for row in rows {
        match latest.get(&row.pair_name) {
            Some(current) if current.last_updated > row.last_updated => {}
            _ => {
                latest.insert(row.pair_name.clone(), row);
            }
        }
    }
    latest
}

fn tab_info(tab: &TabRegistry, risk: TabParams) -> TabInfo {
    TabInfo {
        tab_code: tab.tab_code.clone(),
        tab_name: tab.tab_name,
        currency_name: tab.curr_name.clone(),
        is_clt_alt_del: tab.is_clt_alt_del,
        is_tab: tab.is_tab,
        missing_count: tab.missing_count,
        revival_count: tab.revival_count,
        frozen: tab.frozen,
        risk_penalty_per_frame: risk.risk_penalty_per_frame,
        process_fee_rate: risk.process_fee_rate,
        min_reserve_ratio: risk.min_reserve_ratio,
        liquidation_ratio: risk.liquidation_ratio,
    }
}

async fn quote_details(
    store: &dyn OracleStore,
    median: &MedianPrice,
) -> OracleResult<Vec<QuoteDetail>> {
    let mut details = Vec::with_capacity(median.active_slot);
    for slot in median.slots.iter().take(median.active_slot) {
        let Some(row_id) = slot.price_pair_id else {
            continue;
        };
        if let Some((price, provider)) = store.price_row(row_id).await? {
            details.push(QuoteDetail {
                provider,
                quote: price.to_string(),
            });
        }
    }
    Ok(details)
}

/// Currently published quotes
pub async fn live_quotes(
    store: &dyn OracleStore,
    cache: &ParamsCache,
    query: &LiveQuery,
    now: DateTime<Utc>,
) -> OracleResult<LiveQuotes> {
    let params = cache.params();
    let since = now - Duration::seconds(params.inactive_period_secs + params.live_grace_secs);

    let filter: Option<Vec<String>> = match &query.currency {
        Some(curr) => {
            let code = TabCode::from_request(curr)
                .ok_or_else(|| OracleError::validation(format!("Invalid currency {}", curr)))?;
            let mut names = vec![USD.to_string()];
            if !code.is_usd() {
                names.push(code.to_string());
            }
            names.extend(params.wrapped_reserve_symbols.iter().cloned());
            Some(names)
        }
        None => None,
    };

    let rows: Vec<ActiveMedian> = store
        .active_medians_since(since)
        .await?
        .into_iter()
        .filter(|a| filter.as_ref().map_or(true, |names| names.contains(&a.pair_name)))
        .collect();
    if rows.is_empty() {
        return Err(OracleError::no_data("No data"));
    }

    let mut wrapped_btc_tokens = BTreeMap::new();
    let mut quotes = BTreeMap::new();
    for (key, active) in latest_per_key(rows) {
        let Some(median) = store.median_price(active.median_price_id).await? else {
            tracing::warn!(key = %key, median_price_id = %active.median_price_id, "Active median without median row");
            continue;
        };

        if params.is_wrapped_reserve(&key) {
            wrapped_btc_tokens.insert(
                key,
                ReserveQuote {
                    median: median.median_value.to_string(),
                    last_updated: active.last_updated.timestamp_millis(),
                },
            );
            continue;
        }

        let Some(code) = TabCode::parse(&key) else {
            continue;
        };
        let Some(tab) = store.tab(code).await? else {
            continue;
        };
        if query.tab_only && !tab.is_tab {
            continue;
        }

        let cid = store
            .batch(median.median_batch_id)
            .await?
            .and_then(|b| b.cid);
        let details = if query.details {
            Some(quote_details(store, &median).await?)
        } else {
            None
        };
        quotes.insert(
            format!("{}{}", median.base_currency, key),
            LiveQuote {
                tab: tab_info(&tab, cache.tab_params(code).await),
                median: median.median_value.to_string(),
                last_updated: active.last_updated.timestamp_millis(),
                cid,
                details,
            },
        );
    }

    Ok(LiveQuotes {
        popular_tabs: params.popular_tabs.clone(),
        wrapped_btc_tokens,
        quotes,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord {
    /// Batch time in milliseconds
    pub time: i64,
    pub rate: String,
    pub provider_count: usize,
    pub status: Option<TabStatus>,
    pub refresh: bool,
    pub movement_delta: String,
    pub overwritten_median: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct History {
    pub count: usize,
    pub records: Vec<HistoryRecord>,
}

/// Median history of one currency, newest first, priced in `reserve_symbol`.
///
/// `BTC` yields the raw BTC/tab medians; a USD currency against a USD-pegged
/// reserve is fixed at 1.
pub async fn history(
    store: &dyn OracleStore,
    curr: &str,
    limit: Option<usize>,
    reserve_symbol: &str,
) -> OracleResult<History> {
    let code = TabCode::from_request(curr)
        .ok_or_else(|| OracleError::validation(format!("Invalid currency {}", curr)))?;
    let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT);
    let reserve = reserve_symbol.to_uppercase();

    let rows = store
        .median_history(BASE_CURRENCY, code.as_str(), limit)
        .await?;
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(batch) = store.batch(row.median_batch_id).await? else {
            continue;
        };

        let rate: BigUint = if code.as_str().contains(USD) && reserve.contains(USD) {
            scale()
        } else if reserve == BASE_CURRENCY {
            row.median_value.clone()
        } else {
            let btc_usd = store
                .batch_median(row.median_batch_id, BASE_CURRENCY, USD)
                .await?;
            let wrapped = store
                .batch_median(row.median_batch_id, &reserve, WRAPPED_DEST_CURRENCY)
                .await?;
            match (btc_usd, wrapped) {
                (Some(btc_usd), Some(wrapped)) => adjusted_reserve_price(
                    &wrapped.median_value,
                    &btc_usd.median_value,
                    &row.median_value,
                )
                .unwrap_or_else(|| row.median_value.clone()),
                _ => {
                    tracing::error!(
                        batch_id = %row.median_batch_id,
                        reserve = %reserve,
                        "No BTC/USD or wrapped reserve rate in batch"
                    );
                    row.median_value.clone()
                }
            }
        };

        records.push(HistoryRecord {
            time: batch.created_datetime.timestamp_millis(),
            rate: rate.to_string(),
            provider_count: row.active_slot,
            status: row.tab_status,
            refresh: row.refresh_median,
            movement_delta: row.movement_delta.to_string(),
            overwritten_median: row.overwritten_median.to_string(),
        });
    }

    Ok(History {
        count: records.len(),
        records,
    })
}

/// Provider directory keyed by address
pub async fn provider_directory(cache: &ParamsCache) -> BTreeMap<String, ProviderSummary> {
    cache.provider_directory().await
}
