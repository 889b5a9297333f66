//! Process-wide params cache
//!
//! Mirrors the provider directory and tab registry from chain into the store,
//! keeps the provider auth records next to them, and carries the static
//! oracle params every operation reads. Refreshed periodically by the
//! scheduler; callers check `is_stale` before trusting it.

use chrono::{DateTime, Duration, Utc};
use ethers::types::Address;
use futures_util::future::try_join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::chain::{ChainReader, ProviderInfo, TabParams};
use crate::config::AppConfig;
use crate::error::OracleResult;
use crate::fixed_point::from_u256;
use crate::store::{AuthRecord, FeedProvider, OracleStore, TabRegistry};
use crate::types::TabCode;

/// Static tuning read by aggregation and the read surface
#[derive(Debug, Clone)]
pub struct OracleParams {
    /// Seconds after which the active median is refreshed regardless of movement
    pub inactive_period_secs: i64,
    pub movement_delta: u64,
    pub popular_tabs: Vec<String>,
    pub wrapped_reserve_symbols: Vec<String>,
    pub default_reserve_symbol: String,
    pub genesis: DateTime<Utc>,
    pub live_grace_secs: i64,
}

impl OracleParams {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            inactive_period_secs: config.oracle.inactive_period_secs as i64,
            movement_delta: config.oracle.movement_delta,
            popular_tabs: config.oracle.popular_tabs.clone(),
            wrapped_reserve_symbols: config
                .oracle
                .wrapped_reserve_symbols
                .iter()
                .map(|s| s.to_uppercase())
                .collect(),
            default_reserve_symbol: config.oracle.default_reserve_symbol.to_uppercase(),
            genesis: config.oracle.genesis,
            live_grace_secs: config.oracle.live_grace_secs as i64,
        }
    }

    pub fn is_wrapped_reserve(&self, symbol: &str) -> bool {
        self.wrapped_reserve_symbols.iter().any(|s| s == symbol)
    }
}

impl Default for OracleParams {
    fn default() -> Self {
        Self {
            inactive_period_secs: 3600,
            movement_delta: 500,
            popular_tabs: vec!["USD".to_string()],
            wrapped_reserve_symbols: vec!["CBBTC".to_string(), "WBTC".to_string()],
            default_reserve_symbol: "CBBTC".to_string(),
            genesis: DateTime::<Utc>::default(),
            live_grace_secs: 300,
        }
    }
}

/// Provider directory entry with its auth record
#[derive(Debug, Clone)]
pub struct CachedProvider {
    pub provider: FeedProvider,
    pub auth: Option<AuthRecord>,
}

/// Public view of a provider; hides the token hash
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    #[serde(flatten)]
    pub provider: FeedProvider,
    pub auth: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub providers: usize,
    pub active_providers: usize,
    pub tabs: usize,
}

#[derive(Default)]
struct CacheState {
    providers: HashMap<Address, CachedProvider>,
    tab_params: HashMap<TabCode, TabParams>,
    refreshed_at: Option<DateTime<Utc>>,
}

pub struct ParamsCache {
    params: OracleParams,
    staleness: Duration,
    state: RwLock<CacheState>,
}

impl ParamsCache {
    pub fn new(params: OracleParams, staleness_secs: u64) -> Self {
        Self {
            params,
            staleness: Duration::seconds(staleness_secs as i64),
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn params(&self) -> &OracleParams {
        &self.params
    }

    /// Never refreshed, or refreshed longer than the staleness window ago
    pub async fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.state.read().await.refreshed_at {
            Some(at) => now - at > self.staleness,
            None => true,
        }
    }

    pub async fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.refreshed_at
    }

    pub async fn provider(&self, address: Address) -> Option<CachedProvider> {
        self.state.read().await.providers.get(&address).cloned()
    }

    /// Cached providers ordered by their on-chain index
    pub async fn providers(&self) -> Vec<FeedProvider> {
        let state = self.state.read().await;
        let mut providers: Vec<FeedProvider> = state
            .providers
            .values()
            .map(|c| c.provider.clone())
            .collect();
        providers.sort_by_key(|p| p.index);
        providers
    }

    /// Provider directory keyed by address
    pub async fn provider_directory(&self) -> BTreeMap<String, ProviderSummary> {
        let state = self.state.read().await;
        state
            .providers
            .iter()
            .map(|(address, cached)| {
                (
                    format!("{:#x}", address),
                    ProviderSummary {
                        provider: cached.provider.clone(),
                        auth: cached.auth.is_some(),
                    },
                )
            })
            .collect()
    }

    pub async fn tab_params(&self, tab: TabCode) -> TabParams {
        self.state
            .read()
            .await
            .tab_params
            .get(&tab)
            .copied()
            .unwrap_or_default()
    }

    /// Attach a freshly issued auth record to a cached provider
    pub async fn set_auth(&self, record: AuthRecord) {
        let mut state = self.state.write().await;
        if let Some(cached) = state.providers.get_mut(&record.user_id) {
            cached.auth = Some(record);
        }
    }

    /// Reload providers, tabs and auth records from chain and store
    pub async fn refresh(
        &self,
        store: &dyn OracleStore,
        chain: &dyn ChainReader,
        now: DateTime<Utc>,
    ) -> OracleResult<RefreshSummary> {
        tracing::info!("Params cache refresh started");
        let now_secs = now.timestamp();

        // Providers: status for all, info for the active ones
        let addresses = chain.provider_addresses().await?;
        let statuses =
            try_join_all(addresses.iter().map(|a| chain.provider_status(*a))).await?;
        let infos = try_join_all(addresses.iter().zip(&statuses).map(|(address, status)| {
            let active = status.is_active_at(now_secs);
            async move {
                if active {
                    chain.provider_info(*address).await.map(Some)
                } else {
                    Ok::<Option<ProviderInfo>, _>(None)
                }
            }
        }))
        .await?;

        // Tabs: activated list with frozen flags, de-peg list and risk params
        let tabs = chain.activated_tabs().await?;
        let depegged = chain.depegged_tabs().await?;
        let frozen = try_join_all(tabs.iter().map(|t| chain.is_frozen(*t))).await?;
        let params = try_join_all(tabs.iter().map(|t| chain.tab_params(*t))).await?;

        let known: HashMap<Address, FeedProvider> = store
            .providers()
            .await?
            .into_iter()
            .map(|p| (p.pub_address, p))
            .collect();

        let mut providers = HashMap::new();
        let mut active_providers = 0;
        for ((address, status), info) in addresses.iter().zip(statuses).zip(infos) {
            let mut row = known
                .get(address)
                .cloned()
                .unwrap_or_else(|| FeedProvider::new(*address, now));
            row.updated_datetime = now;
            row.index = status.index;
            row.activated_since_block = status.activated_since_block;
            row.activated_timestamp = status.activated_timestamp;
            row.disabled_since_block = status.disabled_since_block;
            row.disabled_timestamp = status.disabled_timestamp;
            row.paused = status.paused;
            if let Some(info) = info {
                active_providers += 1;
                row.payment_term_block_count = info.payment_term_block_count;
                row.payment_token_address = info.payment_token_address;
                row.payment_amount = from_u256(info.payment_amount);
                row.block_count_per_feed = info.block_count_per_feed;
                row.feed_size = info.feed_size as usize;
                row.whitelisted_ip = info.whitelisted_ip;
            }
            let row = store.upsert_provider(row).await?;
            providers.insert(*address, CachedProvider { provider: row, auth: None });
        }

        let mut tab_params = HashMap::new();
        for ((tab, is_frozen), params) in tabs.iter().zip(frozen).zip(params) {
            let mut row = match store.tab(*tab).await? {
                Some(existing) => existing,
                None => {
                    tracing::info!(tab = %tab, "New tab registered from chain");
                    TabRegistry::new(*tab)
                }
            };
            row.is_tab = true;
            row.frozen = is_frozen;
            row.is_clt_alt_del = depegged.contains(tab);
            store.upsert_tab(row).await?;
            tab_params.insert(*tab, params);
        }

        for record in store.auth_records().await? {
            if let Some(cached) = providers.get_mut(&record.user_id) {
                cached.auth = Some(record);
            }
        }

        let summary = RefreshSummary {
            providers: providers.len(),
            active_providers,
            tabs: tabs.len(),
        };
        let mut state = self.state.write().await;
        state.providers = providers;
        state.tab_params = tab_params;
        state.refreshed_at = Some(now);
        drop(state);

        tracing::info!(
            providers = summary.providers,
            active_providers = summary.active_providers,
            tabs = summary.tabs,
            "Params cache refresh completed"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChainReader, ProviderStatus};
    use crate::store::MemoryStore;
    use ethers::types::U256;

    fn code(s: &str) -> TabCode {
        TabCode::parse(s).unwrap()
    }

    fn chain_with(active: Address, paused: Address) -> MockChainReader {
        let mut chain = MockChainReader::new();
        chain
            .expect_provider_addresses()
            .returning(move || Ok(vec![active, paused]));
        chain.expect_provider_status().returning(move |a| {
            Ok(ProviderStatus {
                index: if a == active { 0 } else { 1 },
                paused: a == paused,
                ..Default::default()
            })
        });
        chain.expect_provider_info().times(1).returning(|_| {
            Ok(ProviderInfo {
                feed_size: 5,
                payment_amount: U256::from(42u64),
                whitelisted_ip: "10.0.0.1".to_string(),
                ..Default::default()
            })
        });
        chain
            .expect_activated_tabs()
            .returning(|| Ok(vec![TabCode::parse("EUR").unwrap(), TabCode::parse("JPY").unwrap()]));
        chain
            .expect_depegged_tabs()
            .returning(|| Ok(vec![TabCode::parse("JPY").unwrap()]));
        chain
            .expect_is_frozen()
            .returning(|t| Ok(t.as_str() == "EUR"));
        chain.expect_tab_params().returning(|_| {
            Ok(TabParams {
                liquidation_ratio: 120,
                ..Default::default()
            })
        });
        chain
    }

    #[tokio::test]
    async fn refresh_mirrors_chain_and_keeps_counters() {
        let store = MemoryStore::new();
        let mut existing = TabRegistry::new(code("EUR"));
        existing.missing_count = 2;
        store.upsert_tab(existing).await.unwrap();

        let active = Address::repeat_byte(1);
        let paused = Address::repeat_byte(2);
        let chain = chain_with(active, paused);
        let cache = ParamsCache::new(OracleParams::default(), 600);
        let now = Utc::now();
        assert!(cache.is_stale(now).await);

        let summary = cache.refresh(&store, &chain, now).await.unwrap();
        assert_eq!(
            summary,
            RefreshSummary {
                providers: 2,
                active_providers: 1,
                tabs: 2
            }
        );
        assert!(!cache.is_stale(now).await);
        assert!(cache.is_stale(now + Duration::seconds(601)).await);

        let cached = cache.provider(active).await.unwrap();
        assert_eq!(cached.provider.feed_size, 5);
        assert_eq!(cached.provider.whitelisted_ip, "10.0.0.1");
        assert!(cache.provider(paused).await.unwrap().provider.paused);

        let eur = store.tab(code("EUR")).await.unwrap().unwrap();
        assert!(eur.is_tab && eur.frozen && !eur.is_clt_alt_del);
        assert_eq!(eur.missing_count, 2);
        let jpy = store.tab(code("JPY")).await.unwrap().unwrap();
        assert!(jpy.is_clt_alt_del && !jpy.frozen);

        assert_eq!(cache.tab_params(code("EUR")).await.liquidation_ratio, 120);
        assert_eq!(cache.tab_params(code("MYR")).await, TabParams::default());
    }

    #[tokio::test]
    async fn refresh_attaches_auth_records() {
        let store = MemoryStore::new();
        let active = Address::repeat_byte(1);
        store
            .upsert_auth(active, "hashed".to_string())
            .await
            .unwrap();
        let cache = ParamsCache::new(OracleParams::default(), 600);
        cache
            .refresh(&store, &chain_with(active, Address::repeat_byte(2)), Utc::now())
            .await
            .unwrap();

        let directory = cache.provider_directory().await;
        assert!(directory[&format!("{:#x}", active)].auth);
        assert!(!directory[&format!("{:#x}", Address::repeat_byte(2))].auth);
        assert_eq!(cache.providers().await[0].pub_address, active);
    }
}
