//! Publication policy for active medians
//!
//! A new median replaces the published one when nothing is published yet,
//! when the published value is older than the inactive period, or when the
//! price moved by more than the configured threshold.

use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use num_traits::Zero;

use crate::cache::OracleParams;
use crate::error::OracleResult;
use crate::fixed_point::{movement_delta, movement_threshold};
use crate::store::{ActiveMedian, MedianPrice, OracleStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishDecision {
    pub refresh: bool,
    /// Movement against the published value, percent at 18 decimals
    pub movement_delta: BigUint,
    /// Value that was published when the new median was computed
    pub overwritten: BigUint,
}

/// Published rate of a pool key with the median row it points at
pub async fn current_rate(
    store: &dyn OracleStore,
    key: &str,
) -> OracleResult<Option<(ActiveMedian, MedianPrice)>> {
    let Some(active) = store.latest_active_median(key).await? else {
        return Ok(None);
    };
    let median = store.median_price(active.median_price_id).await?;
    Ok(median.map(|m| (active, m)))
}

/// Whether `new_median` should replace the published value at `batch_time`.
///
/// A zero published value always yields to the new median.
pub fn decide(
    current: Option<(&ActiveMedian, &BigUint)>,
    new_median: &BigUint,
    batch_time: DateTime<Utc>,
    params: &OracleParams,
) -> PublishDecision {
    let Some((active, old)) = current else {
        return PublishDecision {
            refresh: true,
            movement_delta: BigUint::zero(),
            overwritten: BigUint::zero(),
        };
    };

    let delta = movement_delta(old, new_median);
    let elapsed = (batch_time - active.last_updated).num_seconds();
    let refresh = match &delta {
        None => true,
        Some(d) => {
            elapsed >= params.inactive_period_secs || *d > movement_threshold(params.movement_delta)
        }
    };

    PublishDecision {
        refresh,
        movement_delta: delta.unwrap_or_default(),
        overwritten: old.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn active(age_secs: i64, now: DateTime<Utc>) -> ActiveMedian {
        ActiveMedian {
            id: Uuid::new_v4(),
            pair_name: "JPY".to_string(),
            median_price_id: Uuid::new_v4(),
            last_updated: now - Duration::seconds(age_secs),
        }
    }

    #[test]
    fn first_median_is_published() {
        let d = decide(None, &BigUint::from(5u32), Utc::now(), &OracleParams::default());
        assert!(d.refresh);
        assert!(d.movement_delta.is_zero());
        assert!(d.overwritten.is_zero());
    }

    #[test]
    fn small_recent_move_is_not_published() {
        let now = Utc::now();
        let old = BigUint::from(100_000u32);
        // 0.04% move, threshold 0.05%
        let d = decide(
            Some((&active(60, now), &old)),
            &BigUint::from(100_040u32),
            now,
            &OracleParams::default(),
        );
        assert!(!d.refresh);
        assert_eq!(d.overwritten, old);
        assert!(!d.movement_delta.is_zero());
    }

    #[test]
    fn large_move_is_published() {
        let now = Utc::now();
        let old = BigUint::from(100_000u32);
        let d = decide(
            Some((&active(60, now), &old)),
            &BigUint::from(100_060u32),
            now,
            &OracleParams::default(),
        );
        assert!(d.refresh);
    }

    #[test]
    fn threshold_is_exclusive() {
        let now = Utc::now();
        let old = BigUint::from(100_000u32);
        let d = decide(
            Some((&active(60, now), &old)),
            &BigUint::from(100_050u32),
            now,
            &OracleParams::default(),
        );
        assert!(!d.refresh);
    }

    #[test]
    fn stale_median_is_republished() {
        let now = Utc::now();
        let old = BigUint::from(100_000u32);
        let d = decide(Some((&active(3600, now), &old)), &old, now, &OracleParams::default());
        assert!(d.refresh);
        assert!(d.movement_delta.is_zero());
    }

    #[test]
    fn zero_published_value_yields() {
        let now = Utc::now();
        let d = decide(
            Some((&active(1, now), &BigUint::zero())),
            &BigUint::from(1u32),
            now,
            &OracleParams::default(),
        );
        assert!(d.refresh);
    }
}
