//! Tab health state machine
//!
//! Every batch, each tab pool is classified by how many providers quoted it.
//! Too few quotes for `MISSING_THRESHOLD` consecutive batches freezes the tab;
//! a frozen tab needs `REVIVAL_THRESHOLD` consecutive healthy batches before it
//! is enabled again. Enabled tabs are frozen and unfrozen on chain as well.

use crate::chain::ChainWriter;
use crate::error::OracleResult;
use crate::store::{OracleStore, TabRegistry};
use crate::types::{TabCode, TabStatus};

/// Minimum number of distinct providers for a healthy batch
pub const MIN_FEED_COUNT: usize = 3;
pub const MISSING_THRESHOLD: u32 = 3;
pub const REVIVAL_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainAction {
    Enable,
    Disable,
}

/// Registry row after one batch, and the on-chain action the change requires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub next: TabRegistry,
    pub status: TabStatus,
    pub action: Option<ChainAction>,
}

/// Classify one batch of `feed_count` provider quotes for `row`
pub fn evaluate(row: &TabRegistry, feed_count: usize) -> HealthTransition {
    let mut next = row.clone();
    let mut action = None;

    let status = if feed_count < MIN_FEED_COUNT {
        next.missing_count = row.missing_count.saturating_add(1);
        if row.frozen {
            next.revival_count = 0;
            TabStatus::Frozen
        } else if next.missing_count >= MISSING_THRESHOLD {
            next.frozen = true;
            next.revival_count = 0;
            if row.is_tab {
                action = Some(ChainAction::Disable);
            }
            TabStatus::Frozen
        } else {
            TabStatus::Missing
        }
    } else if row.frozen {
        let revival = row.revival_count.saturating_add(1);
        if revival >= REVIVAL_THRESHOLD {
            next.frozen = false;
            next.missing_count = 0;
            next.revival_count = 0;
            if row.is_tab {
                action = Some(ChainAction::Enable);
            }
            TabStatus::Active
        } else {
            next.revival_count = revival;
            TabStatus::Recovering
        }
    } else {
        next.missing_count = 0;
        next.revival_count = 0;
        TabStatus::Active
    };

    HealthTransition {
        next,
        status,
        action,
    }
}

/// Registry row for `code`, created with default counters on first sight
pub async fn ensure_tab(store: &dyn OracleStore, code: TabCode) -> OracleResult<TabRegistry> {
    if let Some(row) = store.tab(code).await? {
        return Ok(row);
    }
    let row = store.upsert_tab(TabRegistry::new(code)).await?;
    tracing::info!(tab = %code, "Registered new currency");
    Ok(row)
}

/// Evaluate and persist one batch for a tab.
///
/// When the required chain call fails the registry row is left unchanged and
/// the status reflects the unchanged row.
pub async fn apply_health(
    store: &dyn OracleStore,
    writer: &dyn ChainWriter,
    row: &TabRegistry,
    feed_count: usize,
) -> OracleResult<TabStatus> {
    let transition = evaluate(row, feed_count);

    if let Some(action) = transition.action {
        let result = match action {
            ChainAction::Disable => writer.disable_tab(row.tab_name).await,
            ChainAction::Enable => writer.enable_tab(row.tab_name).await,
        };
        match result {
            Ok(tx) => {
                tracing::info!(tab = %row.tab_name, action = ?action, tx = %format!("{:#x}", tx), "Tab state changed on chain");
            }
            Err(e) => {
                tracing::error!(tab = %row.tab_name, action = ?action, error = %e, "Tab state change failed, registry unchanged");
                let status = if row.frozen {
                    TabStatus::Frozen
                } else {
                    TabStatus::Missing
                };
                return Ok(status);
            }
        }
    }

    if transition.next != *row {
        store.upsert_tab(transition.next).await?;
    }
    if transition.status != TabStatus::Active {
        tracing::warn!(
            tab = %row.tab_name,
            status = %transition.status,
            feed_count,
            "Tab below healthy feed count"
        );
    }
    Ok(transition.status)
}
