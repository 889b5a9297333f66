//! In-memory `OracleStore`
//!
//! Keeps every table in a single async-locked struct. Append-only tables are
//! vectors in insertion order; keyed tables are maps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use num_bigint::BigUint;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::*;
use crate::types::{PoolKey, TabCode, WRAPPED_DEST_CURRENCY};

#[derive(Default)]
struct Tables {
    providers: HashMap<Address, FeedProvider>,
    auth: HashMap<Address, AuthRecord>,
    submissions: Vec<PriceSubmission>,
    price_pairs: Vec<PricePair>,
    wrapped: Vec<WrappedReservePrice>,
    batches: Vec<MedianBatch>,
    medians: Vec<MedianPrice>,
    active: Vec<ActiveMedian>,
    tabs: HashMap<TabCode, TabRegistry>,
    pegs: Vec<PeggedTab>,
    performance: Vec<ProviderPerformance>,
}

impl Tables {
    fn submission(&self, id: Uuid) -> Option<&PriceSubmission> {
        self.submissions.iter().find(|s| s.id == id)
    }

    fn provider_address(&self, provider_id: Uuid) -> Option<Address> {
        self.providers
            .values()
            .find(|p| p.id == provider_id)
            .map(|p| p.pub_address)
    }

    fn batch_time(&self, batch_id: Uuid) -> Option<DateTime<Utc>> {
        self.batches
            .iter()
            .find(|b| b.id == batch_id)
            .map(|b| b.created_datetime)
    }

    /// Join a price row with its submission and provider, if it falls after `since`
    fn pool_row(
        &self,
        row_id: Uuid,
        submission_id: Uuid,
        key: PoolKey,
        price: &BigUint,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Option<PoolRow> {
        let submission = self.submission(submission_id)?;
        if submission.created_datetime <= since || submission.created_datetime > until {
            return None;
        }
        let provider_address = self.provider_address(submission.feed_provider_id)?;
        Some(PoolRow {
            row_id,
            submission_id,
            provider_id: submission.feed_provider_id,
            provider_address,
            submitted_at: submission.created_datetime,
            key,
            price: price.clone(),
        })
    }
}

/// Process-local store
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OracleStore for MemoryStore {
    async fn upsert_provider(&self, mut provider: FeedProvider) -> StoreResult<FeedProvider> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.providers.get(&provider.pub_address) {
            provider.id = existing.id;
            provider.created_datetime = existing.created_datetime;
        }
        tables
            .providers
            .insert(provider.pub_address, provider.clone());
        Ok(provider)
    }

    async fn providers(&self) -> StoreResult<Vec<FeedProvider>> {
        let tables = self.tables.read().await;
        let mut providers: Vec<FeedProvider> = tables.providers.values().cloned().collect();
        providers.sort_by_key(|p| p.index);
        Ok(providers)
    }

    async fn upsert_auth(&self, user_id: Address, api_token: String) -> StoreResult<AuthRecord> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        let record = match tables.auth.get(&user_id) {
            Some(existing) => AuthRecord {
                api_token,
                updated_datetime: now,
                ..existing.clone()
            },
            None => AuthRecord {
                id: Uuid::new_v4(),
                user_id,
                api_token,
                created_datetime: now,
                updated_datetime: now,
            },
        };
        tables.auth.insert(user_id, record.clone());
        Ok(record)
    }

    async fn auth_records(&self) -> StoreResult<Vec<AuthRecord>> {
        Ok(self.tables.read().await.auth.values().cloned().collect())
    }

    async fn latest_submission(&self, provider_id: Uuid) -> StoreResult<Option<PriceSubmission>> {
        let tables = self.tables.read().await;
        Ok(tables
            .submissions
            .iter()
            .filter(|s| s.feed_provider_id == provider_id)
            .max_by_key(|s| s.created_datetime)
            .cloned())
    }

    async fn insert_submission(
        &self,
        submission: PriceSubmission,
        pairs: Vec<PricePair>,
        wrapped: Vec<WrappedReservePrice>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.submission(submission.id).is_some() {
            return Err(StoreError::Conflict(format!(
                "submission {} already exists",
                submission.id
            )));
        }
        if let Some(orphan) = pairs
            .iter()
            .map(|p| p.feed_submission_id)
            .chain(wrapped.iter().map(|w| w.feed_submission_id))
            .find(|id| *id != submission.id)
        {
            return Err(StoreError::Conflict(format!(
                "row references submission {} instead of {}",
                orphan, submission.id
            )));
        }
        if let Some(last) = tables
            .submissions
            .iter()
            .filter(|s| s.feed_provider_id == submission.feed_provider_id)
            .map(|s| s.feed_timestamp)
            .max()
        {
            if submission.feed_timestamp <= last {
                return Err(StoreError::Conflict(format!(
                    "feed timestamp {} is not after {}",
                    submission.feed_timestamp, last
                )));
            }
        }
        tables.submissions.push(submission);
        tables.price_pairs.extend(pairs);
        tables.wrapped.extend(wrapped);
        Ok(())
    }

    async fn submission(&self, id: Uuid) -> StoreResult<Option<PriceSubmission>> {
        Ok(self.tables.read().await.submission(id).cloned())
    }

    async fn submissions_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<PriceSubmission>> {
        let tables = self.tables.read().await;
        Ok(tables
            .submissions
            .iter()
            .filter(|s| s.created_datetime >= since)
            .cloned()
            .collect())
    }

    async fn price_rows_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<PoolRow>> {
        let tables = self.tables.read().await;
        Ok(tables
            .price_pairs
            .iter()
            .filter_map(|p| {
                tables.pool_row(
                    p.id,
                    p.feed_submission_id,
                    PoolKey::Tab(p.pair_name),
                    &p.price,
                    since,
                    until,
                )
            })
            .collect())
    }

    async fn wrapped_rows_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<PoolRow>> {
        let tables = self.tables.read().await;
        Ok(tables
            .wrapped
            .iter()
            .filter(|w| w.dest_currency == WRAPPED_DEST_CURRENCY)
            .filter_map(|w| {
                tables.pool_row(
                    w.id,
                    w.feed_submission_id,
                    PoolKey::Reserve(w.symbol.clone()),
                    &w.price,
                    since,
                    until,
                )
            })
            .collect())
    }

    async fn price_row(&self, id: Uuid) -> StoreResult<Option<(BigUint, Address)>> {
        let tables = self.tables.read().await;
        let row = tables
            .price_pairs
            .iter()
            .find(|p| p.id == id)
            .map(|p| (p.price.clone(), p.feed_submission_id))
            .or_else(|| {
                tables
                    .wrapped
                    .iter()
                    .find(|w| w.id == id)
                    .map(|w| (w.price.clone(), w.feed_submission_id))
            });
        Ok(row.and_then(|(price, submission_id)| {
            let submission = tables.submission(submission_id)?;
            let address = tables.provider_address(submission.feed_provider_id)?;
            Some((price, address))
        }))
    }

    async fn latest_batch(&self) -> StoreResult<Option<MedianBatch>> {
        let tables = self.tables.read().await;
        Ok(tables
            .batches
            .iter()
            .max_by_key(|b| b.created_datetime)
            .cloned())
    }

    async fn insert_batch(&self, batch: MedianBatch) -> StoreResult<MedianBatch> {
        self.tables.write().await.batches.push(batch.clone());
        Ok(batch)
    }

    async fn set_batch_cid(&self, batch_id: Uuid, cid: String) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let batch = tables
            .batches
            .iter_mut()
            .find(|b| b.id == batch_id)
            .ok_or_else(|| StoreError::NotFound(format!("median batch {}", batch_id)))?;
        batch.cid = Some(cid);
        Ok(())
    }

    async fn batch(&self, id: Uuid) -> StoreResult<Option<MedianBatch>> {
        let tables = self.tables.read().await;
        Ok(tables.batches.iter().find(|b| b.id == id).cloned())
    }

    async fn insert_median_price(&self, median: MedianPrice) -> StoreResult<MedianPrice> {
        let mut tables = self.tables.write().await;
        if tables.batch_time(median.median_batch_id).is_none() {
            return Err(StoreError::NotFound(format!(
                "median batch {}",
                median.median_batch_id
            )));
        }
        tables.medians.push(median.clone());
        Ok(median)
    }

    async fn median_price(&self, id: Uuid) -> StoreResult<Option<MedianPrice>> {
        let tables = self.tables.read().await;
        Ok(tables.medians.iter().find(|m| m.id == id).cloned())
    }

    async fn median_history(
        &self,
        base_currency: &str,
        pair_name: &str,
        limit: usize,
    ) -> StoreResult<Vec<MedianPrice>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<(DateTime<Utc>, usize, &MedianPrice)> = tables
            .medians
            .iter()
            .enumerate()
            .filter(|(_, m)| m.base_currency == base_currency && m.pair_name == pair_name)
            .filter_map(|(i, m)| Some((tables.batch_time(m.median_batch_id)?, i, m)))
            .collect();
        rows.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|(_, _, m)| m.clone())
            .collect())
    }

    async fn batch_median(
        &self,
        batch_id: Uuid,
        base_currency: &str,
        pair_name: &str,
    ) -> StoreResult<Option<MedianPrice>> {
        let tables = self.tables.read().await;
        Ok(tables
            .medians
            .iter()
            .find(|m| {
                m.median_batch_id == batch_id
                    && m.base_currency == base_currency
                    && m.pair_name == pair_name
            })
            .cloned())
    }

    async fn insert_active_median(&self, active: ActiveMedian) -> StoreResult<ActiveMedian> {
        let mut tables = self.tables.write().await;
        if !tables.medians.iter().any(|m| m.id == active.median_price_id) {
            return Err(StoreError::NotFound(format!(
                "median price {}",
                active.median_price_id
            )));
        }
        tables.active.push(active.clone());
        Ok(active)
    }

    async fn latest_active_median(&self, pair_name: &str) -> StoreResult<Option<ActiveMedian>> {
        let tables = self.tables.read().await;
        Ok(tables
            .active
            .iter()
            .enumerate()
            .filter(|(_, a)| a.pair_name == pair_name)
            .max_by_key(|(i, a)| (a.last_updated, *i))
            .map(|(_, a)| a.clone()))
    }

    async fn active_medians_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<ActiveMedian>> {
        let tables = self.tables.read().await;
        Ok(tables
            .active
            .iter()
            .filter(|a| a.last_updated >= since)
            .cloned()
            .collect())
    }

    async fn tab(&self, code: TabCode) -> StoreResult<Option<TabRegistry>> {
        Ok(self.tables.read().await.tabs.get(&code).cloned())
    }

    async fn tabs(&self) -> StoreResult<Vec<TabRegistry>> {
        let tables = self.tables.read().await;
        let mut tabs: Vec<TabRegistry> = tables.tabs.values().cloned().collect();
        tabs.sort_by_key(|t| t.tab_name);
        Ok(tabs)
    }

    async fn upsert_tab(&self, mut tab: TabRegistry) -> StoreResult<TabRegistry> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.tabs.get(&tab.tab_name) {
            tab.id = existing.id;
        }
        tables.tabs.insert(tab.tab_name, tab.clone());
        Ok(tab)
    }

    async fn pegged_tabs(&self) -> StoreResult<Vec<PeggedTab>> {
        let tables = self.tables.read().await;
        let mut pegs = tables.pegs.clone();
        pegs.sort_by_key(|p| (p.peg_to_tab, p.pegged_tab));
        Ok(pegs)
    }

    async fn pegged_tab(&self, code: TabCode) -> StoreResult<Option<PeggedTab>> {
        let tables = self.tables.read().await;
        Ok(tables.pegs.iter().find(|p| p.pegged_tab == code).cloned())
    }

    async fn insert_pegged_tab(&self, peg: PeggedTab) -> StoreResult<PeggedTab> {
        let mut tables = self.tables.write().await;
        if tables.pegs.iter().any(|p| p.pegged_tab == peg.pegged_tab) {
            return Err(StoreError::Conflict(format!(
                "{} is already pegged",
                peg.pegged_tab
            )));
        }
        tables.pegs.push(peg.clone());
        Ok(peg)
    }

    async fn latest_provider_performance(&self) -> StoreResult<Option<ProviderPerformance>> {
        let tables = self.tables.read().await;
        Ok(tables
            .performance
            .iter()
            .max_by_key(|p| p.created_datetime)
            .cloned())
    }

    async fn insert_provider_performance(
        &self,
        record: ProviderPerformance,
    ) -> StoreResult<ProviderPerformance> {
        self.tables.write().await.performance.push(record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn code(s: &str) -> TabCode {
        TabCode::parse(s).unwrap()
    }

    async fn seeded_provider(store: &MemoryStore, byte: u8) -> FeedProvider {
        store
            .upsert_provider(FeedProvider::new(Address::repeat_byte(byte), Utc::now()))
            .await
            .unwrap()
    }

    fn submission(provider: &FeedProvider, at: DateTime<Utc>) -> PriceSubmission {
        PriceSubmission {
            id: Uuid::new_v4(),
            created_datetime: at,
            feed_provider_id: provider.id,
            feed_timestamp: at.timestamp(),
            json_content: "{}".to_string(),
        }
    }

    fn pair(submission: &PriceSubmission, tab: &str, price: u32) -> PricePair {
        PricePair {
            id: Uuid::new_v4(),
            feed_submission_id: submission.id,
            base_currency: "BTC".to_string(),
            pair_name: code(tab),
            price: BigUint::from(price),
        }
    }

    #[tokio::test]
    async fn rows_are_bounded_by_the_window() {
        let store = MemoryStore::new();
        let provider = seeded_provider(&store, 1).await;
        let boundary = Utc::now();
        let until = boundary + Duration::seconds(10);

        let at_boundary = submission(&provider, boundary);
        let after = submission(&provider, boundary + Duration::seconds(1));
        let late = submission(&provider, until + Duration::seconds(1));
        store
            .insert_submission(at_boundary.clone(), vec![pair(&at_boundary, "JPY", 1)], vec![])
            .await
            .unwrap();
        store
            .insert_submission(after.clone(), vec![pair(&after, "JPY", 2)], vec![])
            .await
            .unwrap();
        store
            .insert_submission(late.clone(), vec![pair(&late, "JPY", 3)], vec![])
            .await
            .unwrap();

        let rows = store.price_rows_between(boundary, until).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].price, BigUint::from(2u32));
        assert_eq!(rows[0].provider_address, provider.pub_address);

        let next = store.price_rows_between(until, late.created_datetime).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].price, BigUint::from(3u32));
    }

    #[tokio::test]
    async fn insert_submission_rejects_foreign_rows() {
        let store = MemoryStore::new();
        let provider = seeded_provider(&store, 2).await;
        let first = submission(&provider, Utc::now());
        let second = submission(&provider, Utc::now());

        let result = store
            .insert_submission(first.clone(), vec![pair(&second, "EUR", 1)], vec![])
            .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert!(store.submission(first.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_submission_requires_newer_feed_timestamp() {
        let store = MemoryStore::new();
        let provider = seeded_provider(&store, 2).await;
        let other = seeded_provider(&store, 3).await;
        let now = Utc::now();
        let first = submission(&provider, now);
        store
            .insert_submission(first.clone(), vec![pair(&first, "JPY", 1)], vec![])
            .await
            .unwrap();

        let mut replay = submission(&provider, now + Duration::seconds(1));
        replay.feed_timestamp = first.feed_timestamp;
        let result = store
            .insert_submission(replay.clone(), vec![pair(&replay, "JPY", 2)], vec![])
            .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert!(store.submission(replay.id).await.unwrap().is_none());

        // other providers keep their own sequence
        let same_second = submission(&other, now);
        store
            .insert_submission(same_second, vec![], vec![])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn upsert_tab_keeps_identity() {
        let store = MemoryStore::new();
        let created = store.upsert_tab(TabRegistry::new(code("MYR"))).await.unwrap();

        let mut changed = TabRegistry::new(code("MYR"));
        changed.missing_count = 2;
        let updated = store.upsert_tab(changed).await.unwrap();

        assert_eq!(updated.id, created.id);
        assert_eq!(store.tab(code("MYR")).await.unwrap().unwrap().missing_count, 2);
        assert_eq!(store.tabs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn latest_active_median_prefers_newest() {
        let store = MemoryStore::new();
        let batch = store
            .insert_batch(MedianBatch {
                id: Uuid::new_v4(),
                created_datetime: Utc::now(),
                cid: None,
            })
            .await
            .unwrap();
        let median = MedianPrice {
            id: Uuid::new_v4(),
            median_batch_id: batch.id,
            base_currency: "BTC".to_string(),
            pair_name: "USD".to_string(),
            median_value: BigUint::from(5u32),
            slots: vec![],
            active_slot: 0,
            tab_status: None,
            feeds: None,
            refresh_median: true,
            movement_delta: BigUint::default(),
            overwritten_median: BigUint::default(),
        };
        store.insert_median_price(median.clone()).await.unwrap();

        let now = Utc::now();
        for offset in [0, 10, 5] {
            store
                .insert_active_median(ActiveMedian {
                    id: Uuid::new_v4(),
                    pair_name: "USD".to_string(),
                    median_price_id: median.id,
                    last_updated: now + Duration::seconds(offset),
                })
                .await
                .unwrap();
        }

        let latest = store.latest_active_median("USD").await.unwrap().unwrap();
        assert_eq!(latest.last_updated, now + Duration::seconds(10));
        assert!(store.latest_active_median("EUR").await.unwrap().is_none());
    }
}
