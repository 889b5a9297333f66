//! Submission intake
//!
//! Runs the provider-level checks, normalizes every quote, and only then
//! writes the submission together with all of its rows.

use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::Serialize;
use uuid::Uuid;

use super::{normalize_quotes, normalize_wrapped_reserves, FeedData};
use crate::cache::OracleParams;
use crate::error::{OracleError, OracleResult};
use crate::store::{
    FeedProvider, OracleStore, PricePair, PriceSubmission, StoreError, WrappedReservePrice,
};
use crate::types::{BASE_CURRENCY, USDBTC, WRAPPED_DEST_CURRENCY};

/// Result of an accepted submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionReceipt {
    pub provider: Address,
    pub processed_count: usize,
}

fn check_provider(provider: &FeedProvider, feed: &FeedData, now_secs: i64) -> OracleResult<()> {
    if provider.paused {
        return Err(OracleError::validation("Paused provider"));
    }
    if provider.is_disabled_at(now_secs) {
        return Err(OracleError::validation("Disabled provider"));
    }
    if !feed.quotes.keys().any(|k| k.eq_ignore_ascii_case(USDBTC)) {
        return Err(OracleError::validation("Missing USDBTC in quotes element"));
    }
    if feed.quotes.len() < provider.feed_size {
        return Err(OracleError::validation(format!(
            "quotes size {} is less than {}",
            feed.quotes.len(),
            provider.feed_size
        )));
    }
    if feed.timestamp > now_secs {
        return Err(OracleError::validation("Invalid data.timestamp value"));
    }
    Ok(())
}

/// Validate and persist one provider submission
///
/// `raw_body` is stored verbatim as the submission content.
pub async fn save_feeds(
    store: &dyn OracleStore,
    params: &OracleParams,
    provider: &FeedProvider,
    feed: &FeedData,
    raw_body: &str,
    now: DateTime<Utc>,
) -> OracleResult<SubmissionReceipt> {
    check_provider(provider, feed, now.timestamp())?;

    if let Some(last) = store.latest_submission(provider.id).await? {
        if feed.timestamp <= last.feed_timestamp {
            return Err(OracleError::validation("Outdated feed"));
        }
    }

    let pairs = normalize_quotes(&feed.quotes)?;
    let reserves = normalize_wrapped_reserves(&feed.wrapped_reserves, params)?;

    let submission = PriceSubmission {
        id: Uuid::new_v4(),
        created_datetime: now,
        feed_provider_id: provider.id,
        feed_timestamp: feed.timestamp,
        json_content: raw_body.to_string(),
    };
    let price_pairs: Vec<PricePair> = pairs
        .into_iter()
        .map(|p| PricePair {
            id: Uuid::new_v4(),
            feed_submission_id: submission.id,
            base_currency: BASE_CURRENCY.to_string(),
            pair_name: p.tab,
            price: p.price,
        })
        .collect();
    let wrapped: Vec<WrappedReservePrice> = reserves
        .into_iter()
        .map(|r| WrappedReservePrice {
            id: Uuid::new_v4(),
            feed_submission_id: submission.id,
            symbol: r.symbol,
            dest_currency: WRAPPED_DEST_CURRENCY.to_string(),
            price: r.price,
        })
        .collect();

    let processed_count = price_pairs.len();
    let submission_id = submission.id;
    let reserve_count = wrapped.len();
    // Another submission may have landed since the check above
    store
        .insert_submission(submission, price_pairs, wrapped)
        .await
        .map_err(|e| match e {
            StoreError::Conflict(reason) => {
                tracing::warn!(reason = %reason, "Submission lost the write race");
                OracleError::validation("Outdated feed")
            }
            other => other.into(),
        })?;

    tracing::info!(
        submission_id = %submission_id,
        provider = %format!("{:#x}", provider.pub_address),
        tab_count = processed_count,
        reserve_count,
        "New submission"
    );

    Ok(SubmissionReceipt {
        provider: provider.pub_address,
        processed_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedEnvelope;
    use crate::store::MemoryStore;
    use chrono::Duration;
    use serde_json::json;

    async fn provider(store: &MemoryStore) -> FeedProvider {
        let mut row = FeedProvider::new(Address::repeat_byte(7), Utc::now());
        row.feed_size = 2;
        store.upsert_provider(row).await.unwrap()
    }

    fn body(timestamp: i64, quotes: serde_json::Value) -> String {
        json!({
            "data": {
                "provider": format!("{:#x}", Address::repeat_byte(7)),
                "timestamp": timestamp,
                "quotes": quotes,
                "wrapped_reserves": {"CBBTC": "99000"}
            },
            "signature": "0x"
        })
        .to_string()
    }

    async fn submit(
        store: &MemoryStore,
        provider: &FeedProvider,
        raw: &str,
        now: DateTime<Utc>,
    ) -> OracleResult<SubmissionReceipt> {
        let feed = FeedEnvelope::parse(raw).unwrap().feed().unwrap();
        save_feeds(store, &OracleParams::default(), provider, &feed, raw, now).await
    }

    #[tokio::test]
    async fn accepted_submission_writes_all_rows() {
        let store = MemoryStore::new();
        let provider = provider(&store).await;
        let now = Utc::now();
        let raw = body(now.timestamp(), json!({"USDBTC": "0.00001", "USDJPY": "150"}));

        let receipt = submit(&store, &provider, &raw, now).await.unwrap();
        assert_eq!(receipt.processed_count, 2);
        assert_eq!(receipt.provider, provider.pub_address);

        let since = now - Duration::seconds(1);
        assert_eq!(store.price_rows_between(since, now).await.unwrap().len(), 2);
        assert_eq!(store.wrapped_rows_between(since, now).await.unwrap().len(), 1);
        let stored = store.latest_submission(provider.id).await.unwrap().unwrap();
        assert_eq!(stored.json_content, raw);
    }

    #[tokio::test]
    async fn outdated_and_future_feeds_are_rejected() {
        let store = MemoryStore::new();
        let provider = provider(&store).await;
        let now = Utc::now();
        let quotes = json!({"USDBTC": "0.00001", "USDJPY": "150"});

        submit(&store, &provider, &body(now.timestamp(), quotes.clone()), now)
            .await
            .unwrap();
        let later = now + Duration::seconds(5);
        let err = submit(&store, &provider, &body(now.timestamp(), quotes.clone()), later)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Outdated feed");

        let err = submit(&store, &provider, &body(later.timestamp() + 10, quotes), later)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid data.timestamp value");
    }

    #[tokio::test]
    async fn concurrent_feeds_with_same_timestamp_store_once() {
        let store = MemoryStore::new();
        let provider = provider(&store).await;
        let now = Utc::now();
        let raw = body(now.timestamp(), json!({"USDBTC": "0.00001", "USDJPY": "150"}));

        let (a, b) = tokio::join!(
            submit(&store, &provider, &raw, now),
            submit(&store, &provider, &raw, now)
        );
        let errors: Vec<OracleError> = [a, b].into_iter().filter_map(Result::err).collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "Outdated feed");

        let since = now - Duration::seconds(1);
        assert_eq!(store.price_rows_between(since, now).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn provider_state_is_checked_first() {
        let store = MemoryStore::new();
        let mut provider = provider(&store).await;
        let now = Utc::now();
        let raw = body(now.timestamp(), json!({"USDBTC": "0.00001", "USDJPY": "150"}));

        provider.paused = true;
        let err = submit(&store, &provider, &raw, now).await.unwrap_err();
        assert_eq!(err.to_string(), "Paused provider");

        provider.paused = false;
        provider.disabled_timestamp = now.timestamp() - 1;
        let err = submit(&store, &provider, &raw, now).await.unwrap_err();
        assert_eq!(err.to_string(), "Disabled provider");
    }

    #[tokio::test]
    async fn rejected_submission_persists_nothing() {
        let store = MemoryStore::new();
        let provider = provider(&store).await;
        let now = Utc::now();

        let too_few = body(now.timestamp(), json!({"USDBTC": "0.00001"}));
        assert!(submit(&store, &provider, &too_few, now).await.is_err());

        let zero = body(now.timestamp(), json!({"USDBTC": "0.00001", "USDJPY": "0"}));
        let err = submit(&store, &provider, &zero, now).await.unwrap_err();
        assert!(matches!(err, OracleError::ZeroRate(_)));

        assert!(store.latest_submission(provider.id).await.unwrap().is_none());
    }
}
