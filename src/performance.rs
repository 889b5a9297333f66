//! Provider performance reporting
//!
//! Counts the submissions each provider made since the previous report and
//! submits the counts to the oracle manager contract in fixed-size chunks.

use chrono::{DateTime, Utc};
use ethers::types::{Address, U256};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::ParamsCache;
use crate::chain::{ChainWriter, FEED_COUNT_CHUNK};
use crate::error::OracleResult;
use crate::store::{OracleStore, ProviderPerformance};

/// One on-chain report: provider addresses and their counts, zero padded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedCountChunk {
    pub providers: [Address; FEED_COUNT_CHUNK],
    pub feed_counts: [U256; FEED_COUNT_CHUNK],
    /// Unpadded entries
    pub len: usize,
}

/// Split `(provider, count)` pairs into padded chunks of `FEED_COUNT_CHUNK`
pub fn chunk_feed_counts(counts: &[(Address, u64)]) -> Vec<FeedCountChunk> {
    counts
        .chunks(FEED_COUNT_CHUNK)
        .map(|chunk| {
            let mut providers = [Address::zero(); FEED_COUNT_CHUNK];
            let mut feed_counts = [U256::zero(); FEED_COUNT_CHUNK];
            for (slot, (provider, count)) in chunk.iter().enumerate() {
                providers[slot] = *provider;
                feed_counts[slot] = U256::from(*count);
            }
            FeedCountChunk {
                providers,
                feed_counts,
                len: chunk.len(),
            }
        })
        .collect()
}

pub struct PerformanceReporter {
    store: Arc<dyn OracleStore>,
    writer: Arc<dyn ChainWriter>,
    cache: Arc<ParamsCache>,
}

impl PerformanceReporter {
    pub fn new(
        store: Arc<dyn OracleStore>,
        writer: Arc<dyn ChainWriter>,
        cache: Arc<ParamsCache>,
    ) -> Self {
        Self {
            store,
            writer,
            cache,
        }
    }

    /// Submission counts per cached provider since the previous report
    pub async fn feed_counts(&self) -> OracleResult<(DateTime<Utc>, Vec<(Address, u64)>)> {
        let since = match self.store.latest_provider_performance().await? {
            Some(last) => last.created_datetime,
            None => self.cache.params().genesis,
        };

        let mut per_provider: HashMap<Uuid, u64> = HashMap::new();
        for submission in self.store.submissions_since(since).await? {
            *per_provider.entry(submission.feed_provider_id).or_default() += 1;
        }

        let mut providers = self.cache.providers().await;
        providers.sort_by_key(|p| p.pub_address);
        let counts = providers
            .into_iter()
            .map(|p| {
                let count = per_provider.get(&p.id).copied().unwrap_or(0);
                (p.pub_address, count)
            })
            .collect();
        Ok((since, counts))
    }

    /// Submit the counts chunk by chunk; each chunk is confirmed before it is recorded
    pub async fn report(&self, now: DateTime<Utc>) -> OracleResult<Vec<ProviderPerformance>> {
        let (since, counts) = self.feed_counts().await?;
        let provider_count = counts.len();
        tracing::info!(since = %since, providers = provider_count, "Reporting provider performance");

        let timestamp = U256::from(now.timestamp().max(0) as u64);
        let mut records = Vec::new();
        for (round, chunk) in chunk_feed_counts(&counts).into_iter().enumerate() {
            let tx = self
                .writer
                .submit_provider_feed_count(chunk.providers, chunk.feed_counts, timestamp)
                .await?;
            let tx_ref = format!("{:#x}", tx);
            tracing::info!(round, tx = %tx_ref, entries = chunk.len, "Provider feed counts submitted");

            let record = self
                .store
                .insert_provider_performance(ProviderPerformance {
                    id: Uuid::new_v4(),
                    created_datetime: now,
                    provider_count,
                    providers: chunk.providers.to_vec(),
                    feed_counts: chunk.feed_counts.iter().map(|c| c.low_u64()).collect(),
                    trx_ref: tx_ref,
                })
                .await?;
            records.push(record);
        }
        Ok(records)
    }
}
