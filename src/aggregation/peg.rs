//! Pegged currencies
//!
//! A pegged tab has no pool of its own; each batch it receives a copy of its
//! source tab's median row scaled by a fixed percent ratio, and is published
//! whenever the source is.

use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use num_traits::Zero;
use serde::Serialize;
use uuid::Uuid;

use super::publisher::current_rate;
use crate::error::OracleResult;
use crate::fixed_point::pegged_rate;
use crate::store::{ActiveMedian, MedianPrice, OracleStore, PeggedTab};
use crate::types::TabCode;

/// Median row of `peg.pegged_tab` derived from the source row
pub fn pegged_median(source: &MedianPrice, peg: &PeggedTab) -> MedianPrice {
    MedianPrice {
        id: Uuid::new_v4(),
        pair_name: peg.pegged_tab.to_string(),
        median_value: pegged_rate(&source.median_value, peg.peg_to_ratio),
        movement_delta: BigUint::zero(),
        overwritten_median: BigUint::zero(),
        ..source.clone()
    }
}

/// Write the pegged rows of every peg sourced from `source`.
///
/// Returns how many pegged rows were written.
pub async fn propagate(
    store: &dyn OracleStore,
    source: &MedianPrice,
    pegs: &[PeggedTab],
    batch_time: DateTime<Utc>,
) -> OracleResult<usize> {
    let mut written = 0;
    for peg in pegs
        .iter()
        .filter(|p| p.peg_to_tab.as_str() == source.pair_name)
    {
        let row = store.insert_median_price(pegged_median(source, peg)).await?;
        if row.refresh_median {
            store
                .insert_active_median(ActiveMedian {
                    id: Uuid::new_v4(),
                    pair_name: peg.pegged_tab.to_string(),
                    median_price_id: row.id,
                    last_updated: batch_time,
                })
                .await?;
        }
        tracing::debug!(
            pegged_tab = %peg.pegged_tab,
            peg_to_tab = %peg.peg_to_tab,
            ratio = peg.peg_to_ratio,
            refresh = row.refresh_median,
            "Pegged median written"
        );
        written += 1;
    }
    Ok(written)
}

/// Rate of a pegged tab derived from its source's published median
#[derive(Debug, Clone, Serialize)]
pub struct PeggedRate {
    pub peg: PeggedTab,
    /// Published source median the rate was derived from
    pub source: ActiveMedian,
    #[serde(with = "crate::fixed_point::biguint_string")]
    pub rate: BigUint,
}

/// Pegged rate of `code`, when it is pegged and its source is published
pub async fn resolve_pegged_rate(
    store: &dyn OracleStore,
    code: TabCode,
) -> OracleResult<Option<PeggedRate>> {
    let Some(peg) = store.pegged_tab(code).await? else {
        return Ok(None);
    };
    let Some((active, median)) = current_rate(store, peg.peg_to_tab.as_str()).await? else {
        return Ok(None);
    };
    let rate = pegged_rate(&median.median_value, peg.peg_to_ratio);
    Ok(Some(PeggedRate {
        peg,
        source: active,
        rate,
    }))
}
