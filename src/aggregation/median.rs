//! Median over one price pool

use num_bigint::BigUint;
use rand::Rng;
use uuid::Uuid;

use crate::store::Slot;

/// Maximum number of prices a median is computed over
pub const MEDIAN_POOL_SIZE: usize = 9;

/// One price entering a median
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntry {
    pub row_id: Uuid,
    pub price: BigUint,
}

/// Median of one pool along with the slots it was taken over
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MedianOutcome {
    pub median: BigUint,
    pub slots: Vec<Slot>,
    pub active_slot: usize,
    /// Every pool value, ascending and comma-joined, when the pool was trimmed
    pub feeds: Option<String>,
}

/// Middle element, or the truncated mean of the two middle elements.
///
/// `sorted` must be in ascending order.
pub fn median_value(sorted: &[BigUint]) -> Option<BigUint> {
    let len = sorted.len();
    if len == 0 {
        return None;
    }
    let mid = len / 2;
    if len % 2 == 1 {
        Some(sorted[mid].clone())
    } else {
        Some((&sorted[mid - 1] + &sorted[mid]) / BigUint::from(2u32))
    }
}

/// Evict uniformly random entries until the pool fits `MEDIAN_POOL_SIZE`.
///
/// Returns the audit trail of the untrimmed pool, or `None` when nothing was
/// evicted. The relative order of the kept entries is preserved.
pub fn trim_pool<R: Rng + ?Sized>(pool: &mut Vec<PoolEntry>, rng: &mut R) -> Option<String> {
    if pool.len() <= MEDIAN_POOL_SIZE {
        return None;
    }
    let feeds = pool
        .iter()
        .map(|e| e.price.to_string())
        .collect::<Vec<_>>()
        .join(",");
    while pool.len() > MEDIAN_POOL_SIZE {
        let victim = rng.gen_range(0..pool.len());
        pool.remove(victim);
    }
    Some(feeds)
}

/// Sort, trim and reduce a pool.
///
/// `pad` fills the slot list with zero placeholders up to `MEDIAN_POOL_SIZE`;
/// it is set for enabled tabs, whose on-chain updates take fixed-size arrays.
pub fn aggregate<R: Rng + ?Sized>(
    mut pool: Vec<PoolEntry>,
    pad: bool,
    rng: &mut R,
) -> Option<MedianOutcome> {
    pool.sort_by(|a, b| a.price.cmp(&b.price));
    let feeds = trim_pool(&mut pool, rng);

    let prices: Vec<BigUint> = pool.iter().map(|e| e.price.clone()).collect();
    let median = median_value(&prices)?;

    let active_slot = pool.len();
    let mut slots: Vec<Slot> = pool
        .into_iter()
        .map(|e| Slot {
            price_pair_id: Some(e.row_id),
            price: e.price,
        })
        .collect();
    if pad {
        slots.resize(MEDIAN_POOL_SIZE, Slot::placeholder());
    }

    Some(MedianOutcome {
        median,
        slots,
        active_slot,
        feeds,
    })
}
