//! Median aggregation
//!
//! - `collector`: batch window rows → per-key pools, one row per provider
//! - `health`: missing/frozen/revival state machine per tab
//! - `median`: trimmed median over a pool
//! - `publisher`: when a new median replaces the published one
//! - `peg`: derived rates of pegged tabs
//! - `cycle`: one batch end to end

pub mod collector;
pub mod cycle;
pub mod health;
pub mod median;
pub mod peg;
pub mod publisher;

pub use collector::{collect, group_rows, BatchPools};
pub use cycle::{CycleOutcome, CycleReport, MedianCycle};
pub use health::{
    apply_health, ensure_tab, evaluate, ChainAction, HealthTransition, MIN_FEED_COUNT,
    MISSING_THRESHOLD, REVIVAL_THRESHOLD,
};
pub use median::{aggregate, median_value, trim_pool, MedianOutcome, PoolEntry, MEDIAN_POOL_SIZE};
pub use peg::{pegged_median, propagate, resolve_pegged_rate, PeggedRate};
pub use publisher::{current_rate, decide, PublishDecision};
