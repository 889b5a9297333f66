//! Median cycle - one aggregation batch end to end
//!
//! Collects every row submitted since the previous batch, runs the health
//! state machine per tab, computes and publishes medians, propagates pegs and
//! archives the contributing submissions. At most one cycle runs at a time;
//! a trigger arriving while a cycle is in flight is skipped.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::collector::{collect, BatchPools};
use super::health::{apply_health, ensure_tab};
use super::median::{aggregate, PoolEntry};
use super::peg::propagate;
use super::publisher::{current_rate, decide};
use crate::archive::{SnapshotArchive, SnapshotEntry, LOCAL_SKIP_UPLOAD};
use crate::cache::OracleParams;
use crate::chain::ChainWriter;
use crate::error::{OracleError, OracleResult};
use crate::store::{ActiveMedian, MedianBatch, MedianPrice, OracleStore, PeggedTab, PoolRow};
use crate::types::{PoolKey, TabStatus};

/// Summary of a completed batch
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub batch_id: Uuid,
    pub created_datetime: DateTime<Utc>,
    pub medians: usize,
    pub published: usize,
    pub pegged: usize,
    /// Pool keys whose processing failed; the rest of the batch still completed
    pub failed: Vec<String>,
    pub cid: String,
}

#[derive(Debug, Clone, Serialize)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Nothing was submitted since the previous batch; no batch was written
    NoData,
    /// Another cycle was already running
    Skipped,
}

struct PoolResult {
    published: bool,
    pegged: usize,
}

pub struct MedianCycle {
    store: Arc<dyn OracleStore>,
    writer: Arc<dyn ChainWriter>,
    archive: Option<Arc<dyn SnapshotArchive>>,
    params: OracleParams,
    /// Single-flight guard; also owns the eviction RNG
    running: Mutex<StdRng>,
}

impl MedianCycle {
    /// `archive` is `None` when snapshots are not uploaded, e.g. on local nodes
    pub fn new(
        store: Arc<dyn OracleStore>,
        writer: Arc<dyn ChainWriter>,
        archive: Option<Arc<dyn SnapshotArchive>>,
        params: OracleParams,
    ) -> Self {
        Self::with_rng(store, writer, archive, params, StdRng::from_entropy())
    }

    pub fn with_rng(
        store: Arc<dyn OracleStore>,
        writer: Arc<dyn ChainWriter>,
        archive: Option<Arc<dyn SnapshotArchive>>,
        params: OracleParams,
        rng: StdRng,
    ) -> Self {
        Self {
            store,
            writer,
            archive,
            params,
            running: Mutex::new(rng),
        }
    }

    /// Run one batch stamped `now`
    pub async fn run(&self, now: DateTime<Utc>) -> OracleResult<CycleOutcome> {
        let Ok(mut rng) = self.running.try_lock() else {
            tracing::warn!("Median cycle already running, skipping trigger");
            return Ok(CycleOutcome::Skipped);
        };

        let since = match self.store.latest_batch().await? {
            Some(batch) => batch.created_datetime,
            None => self.params.genesis,
        };
        let pools = collect(self.store.as_ref(), since, now).await?;
        if pools.is_empty() {
            tracing::info!(since = %since, "No submissions since previous batch");
            return Ok(CycleOutcome::NoData);
        }

        let batch = self
            .store
            .insert_batch(MedianBatch {
                id: Uuid::new_v4(),
                created_datetime: now,
                cid: None,
            })
            .await?;
        tracing::info!(
            batch_id = %batch.id,
            pools = pools.pools.len(),
            rows = pools.row_count(),
            "Median batch started"
        );

        let mut pegs: BTreeMap<String, Vec<PeggedTab>> = BTreeMap::new();
        for peg in self.store.pegged_tabs().await? {
            pegs.entry(peg.peg_to_tab.to_string()).or_default().push(peg);
        }

        let mut report = CycleReport {
            batch_id: batch.id,
            created_datetime: batch.created_datetime,
            medians: 0,
            published: 0,
            pegged: 0,
            failed: Vec::new(),
            cid: String::new(),
        };

        for (key, rows) in &pools.pools {
            let key_pegs = key
                .tab()
                .and_then(|code| pegs.get(code.as_str()))
                .map(Vec::as_slice)
                .unwrap_or_default();
            match self.process_pool(&batch, key, rows, key_pegs, &mut *rng).await {
                Ok(result) => {
                    report.medians += 1;
                    report.published += usize::from(result.published);
                    report.pegged += result.pegged;
                }
                Err(e) => {
                    tracing::error!(batch_id = %batch.id, key = %key, error = %e, "Failed to process price pool");
                    report.failed.push(key.name().to_string());
                }
            }
        }

        report.cid = self.archive_snapshot(&pools).await;
        self.store.set_batch_cid(batch.id, report.cid.clone()).await?;

        tracing::info!(
            batch_id = %report.batch_id,
            medians = report.medians,
            published = report.published,
            pegged = report.pegged,
            failed = report.failed.len(),
            cid = %report.cid,
            "Median batch completed"
        );
        Ok(CycleOutcome::Completed(report))
    }

    async fn process_pool(
        &self,
        batch: &MedianBatch,
        key: &PoolKey,
        rows: &[PoolRow],
        pegs: &[PeggedTab],
        rng: &mut StdRng,
    ) -> OracleResult<PoolResult> {
        let store = self.store.as_ref();

        let (status, pad): (Option<TabStatus>, bool) = match key {
            PoolKey::Tab(code) => {
                let tab = ensure_tab(store, *code).await?;
                let status = apply_health(store, self.writer.as_ref(), &tab, rows.len()).await?;
                (Some(status), tab.is_tab)
            }
            PoolKey::Reserve(_) => (None, false),
        };

        let entries = rows
            .iter()
            .map(|row| PoolEntry {
                row_id: row.row_id,
                price: row.price.clone(),
            })
            .collect();
        let outcome = aggregate(entries, pad, rng)
            .ok_or_else(|| OracleError::no_data(format!("No data for pool {}", key)))?;
        if outcome.feeds.is_some() {
            tracing::info!(key = %key, pool = rows.len(), "Price pool trimmed");
        }

        let current = current_rate(store, key.name()).await?;
        let decision = decide(
            current
                .as_ref()
                .map(|(active, median)| (active, &median.median_value)),
            &outcome.median,
            batch.created_datetime,
            &self.params,
        );

        let median = store
            .insert_median_price(MedianPrice {
                id: Uuid::new_v4(),
                median_batch_id: batch.id,
                base_currency: key.base_currency().to_string(),
                pair_name: key.pair_name().to_string(),
                median_value: outcome.median,
                slots: outcome.slots,
                active_slot: outcome.active_slot,
                tab_status: status,
                feeds: outcome.feeds,
                refresh_median: decision.refresh,
                movement_delta: decision.movement_delta,
                overwritten_median: decision.overwritten,
            })
            .await?;

        if median.refresh_median {
            store
                .insert_active_median(ActiveMedian {
                    id: Uuid::new_v4(),
                    pair_name: key.name().to_string(),
                    median_price_id: median.id,
                    last_updated: batch.created_datetime,
                })
                .await?;
            tracing::debug!(key = %key, median = %median.median_value, "Active median published");
        }

        let pegged = if pegs.is_empty() {
            0
        } else {
            propagate(store, &median, pegs, batch.created_datetime).await?
        };

        Ok(PoolResult {
            published: median.refresh_median,
            pegged,
        })
    }

    /// Archive the contributing submissions; failures yield an empty cid
    async fn archive_snapshot(&self, pools: &BatchPools) -> String {
        let Some(archive) = &self.archive else {
            return LOCAL_SKIP_UPLOAD.to_string();
        };

        let mut entries = Vec::with_capacity(pools.contributors.len());
        for (submission_id, provider) in &pools.contributors {
            match self.store.submission(*submission_id).await {
                Ok(Some(submission)) => entries.push(SnapshotEntry {
                    submission_id: submission.id,
                    provider: *provider,
                    feed_timestamp: submission.feed_timestamp,
                    created_datetime: submission.created_datetime,
                    json_content: submission.json_content,
                }),
                Ok(None) => {
                    tracing::warn!(submission_id = %submission_id, "Contributing submission not found");
                }
                Err(e) => {
                    tracing::error!(submission_id = %submission_id, error = %e, "Failed to load submission for snapshot");
                }
            }
        }

        match archive.archive(&entries).await {
            Ok(cid) => cid,
            Err(e) => {
                tracing::error!(error = %e, entries = entries.len(), "Snapshot archive failed");
                String::new()
            }
        }
    }
}
