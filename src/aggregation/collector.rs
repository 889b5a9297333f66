//! Batch collector - groups the rows of one batch window into price pools

use chrono::{DateTime, Utc};
use ethers::types::Address;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

use crate::error::OracleResult;
use crate::store::{OracleStore, PoolRow};
use crate::types::PoolKey;

/// Deduplicated pools of one batch window
#[derive(Debug, Default)]
pub struct BatchPools {
    /// Tab pools first, then wrapped reserve pools, each in code order
    pub pools: BTreeMap<PoolKey, Vec<PoolRow>>,
    /// Latest contributing submission per provider
    pub contributors: Vec<(Uuid, Address)>,
}

impl BatchPools {
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.pools.values().map(Vec::len).sum()
    }
}

/// Group rows by pool key, keeping the most recent row of each provider.
///
/// Rows are ordered by key, submission time descending, then price; the first
/// row a provider has in a pool wins.
pub fn group_rows(mut rows: Vec<PoolRow>) -> BTreeMap<PoolKey, Vec<PoolRow>> {
    rows.sort_by(|a, b| {
        a.key
            .cmp(&b.key)
            .then_with(|| b.submitted_at.cmp(&a.submitted_at))
            .then_with(|| a.price.cmp(&b.price))
    });

    let mut pools: BTreeMap<PoolKey, Vec<PoolRow>> = BTreeMap::new();
    let mut seen: HashSet<(PoolKey, Uuid)> = HashSet::new();
    for row in rows {
        if !seen.insert((row.key.clone(), row.provider_id)) {
            continue;
        }
        pools.entry(row.key.clone()).or_default().push(row);
    }
    pools
}

/// Latest submission of each provider among the pooled rows
fn contributors(pools: &BTreeMap<PoolKey, Vec<PoolRow>>) -> Vec<(Uuid, Address)> {
    let mut latest: HashMap<Uuid, &PoolRow> = HashMap::new();
    for row in pools.values().flatten() {
        latest
            .entry(row.provider_id)
            .and_modify(|current| {
                if row.submitted_at > current.submitted_at {
                    *current = row;
                }
            })
            .or_insert(row);
    }
    let mut out: Vec<(Uuid, Address)> = latest
        .values()
        .map(|row| (row.submission_id, row.provider_address))
        .collect();
    out.sort_by_key(|(_, address)| *address);
    out
}

/// Read every row submitted in `(since, until]` and pool it
pub async fn collect(
    store: &dyn OracleStore,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> OracleResult<BatchPools> {
    let mut rows = store.price_rows_between(since, until).await?;
    rows.extend(store.wrapped_rows_between(since, until).await?);
    tracing::info!(since = %since, until = %until, rows = rows.len(), "Retrieved price rows for batch window");

    let pools = group_rows(rows);
    let contributors = contributors(&pools);
    Ok(BatchPools {
        pools,
        contributors,
    })
}
