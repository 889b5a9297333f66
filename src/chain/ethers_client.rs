//! JSON-RPC implementation of the chain traits

use async_trait::async_trait;
use ethers::contract::{abigen, ContractCall};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256, U256};
use futures_util::future::try_join_all;
use std::sync::Arc;

use super::{
    ChainError, ChainReader, ChainResult, ChainWriter, NonceSource, ProviderInfo, ProviderStatus,
    TabParams, FEED_COUNT_CHUNK,
};
use crate::config::ChainConfig;
use crate::types::TabCode;

abigen!(
    PriceOracleManagerContract,
    r#"[
        function providerCount() external view returns (uint256)
        function providerList(uint256) external view returns (address)
        function providers(address) external view returns (uint256,uint256,uint256,uint256,uint256,bool)
        function providerInfo(address) external view returns (uint256,address,uint256,uint256,uint256,bytes32)
        function submitProviderFeedCount(address[10] providers, uint256[10] feedCounts, uint256 timestamp) external
    ]"#
);

abigen!(
    TabRegistryContract,
    r#"[
        function activatedTabCount() external view returns (uint256)
        function tabList(uint256) external view returns (bytes3)
        function frozenTabs(bytes3) external view returns (bool)
        function getCtrlAltDelTabList() external view returns (bytes3[])
        function enableTab(bytes3 tab) external
        function disableTab(bytes3 tab) external
    ]"#
);

abigen!(
    PriceOracleContract,
    r#"[
        function nonces(address) external view returns (uint256)
    ]"#
);

abigen!(
    TabConfigContract,
    r#"[
        function tabParams(bytes3) external view returns (uint256,uint256,uint256,uint256)
    ]"#
);

type KeeperClient = SignerMiddleware<Provider<Http>, LocalWallet>;

fn parse_address(label: &str, raw: &str) -> ChainResult<Address> {
    raw.parse()
        .map_err(|_| ChainError::Config(format!("Invalid {} address '{}'", label, raw)))
}

/// Contract client over a single HTTP provider
pub struct EthersChain {
    provider: Arc<Provider<Http>>,
    keeper: Option<Arc<KeeperClient>>,
    oracle_manager: Address,
    tab_registry: Address,
    price_oracle: Address,
    tab_config: Option<Address>,
    gas_limit: U256,
}

impl EthersChain {
    /// Build the client; writes are only available with a keeper key
    pub fn new(config: &ChainConfig, keeper_private_key: Option<&str>) -> ChainResult<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| ChainError::Config(format!("Invalid rpc url '{}': {}", config.rpc_url, e)))?;
        let provider = Arc::new(provider);

        let keeper = match keeper_private_key {
            Some(key) => {
                let wallet: LocalWallet = key
                    .parse()
                    .map_err(|_| ChainError::Config("Invalid keeper private key".to_string()))?;
                let signer = wallet.with_chain_id(config.chain_id);
                tracing::info!(keeper = %format!("{:#x}", signer.address()), "Keeper signer loaded");
                Some(Arc::new(SignerMiddleware::new((*provider).clone(), signer)))
            }
            None => None,
        };

        let tab_config = match config.tab_config_contract.as_deref() {
            Some(raw) if !raw.is_empty() => Some(parse_address("tab config", raw)?),
            _ => None,
        };

        Ok(Self {
            provider,
            keeper,
            oracle_manager: parse_address("oracle manager", &config.oracle_manager_contract)?,
            tab_registry: parse_address("tab registry", &config.tab_registry_contract)?,
            price_oracle: parse_address("price oracle", &config.price_oracle_contract)?,
            tab_config,
            gas_limit: U256::from(config.gas_limit),
        })
    }

    fn manager(&self) -> PriceOracleManagerContract<Provider<Http>> {
        PriceOracleManagerContract::new(self.oracle_manager, self.provider.clone())
    }

    fn registry(&self) -> TabRegistryContract<Provider<Http>> {
        TabRegistryContract::new(self.tab_registry, self.provider.clone())
    }

    fn keeper(&self, call: &str) -> ChainResult<Arc<KeeperClient>> {
        self.keeper
            .clone()
            .ok_or_else(|| ChainError::Config(format!("{} requires a keeper private key", call)))
    }

    /// Send a keeper transaction and wait for its receipt
    async fn confirm(&self, name: &str, call: ContractCall<KeeperClient, ()>) -> ChainResult<H256> {
        let call = call.gas(self.gas_limit);
        let pending = call
            .send()
            .await
            .map_err(|e| ChainError::transaction(name, e))?;
        let tx_hash = pending.tx_hash();
        let receipt = pending
            .await
            .map_err(|e| ChainError::transaction(name, e))?
            .ok_or_else(|| ChainError::transaction(name, "dropped before confirmation"))?;
        if receipt.status == Some(0u64.into()) {
            return Err(ChainError::transaction(name, "reverted"));
        }

        tracing::info!(
            call = name,
            tx_hash = %format!("{:#x}", tx_hash),
            block = ?receipt.block_number,
            "Transaction confirmed"
        );
        Ok(tx_hash)
    }
}

#[async_trait]
impl ChainReader for EthersChain {
    async fn provider_addresses(&self) -> ChainResult<Vec<Address>> {
        let manager = self.manager();
        let count = manager
            .provider_count()
            .call()
            .await
            .map_err(|e| ChainError::call("providerCount", e))?;
        let calls = (0..count.low_u64()).map(|i| {
            let manager = manager.clone();
            async move {
                manager
                    .provider_list(U256::from(i))
                    .call()
                    .await
                    .map_err(|e| ChainError::call("providerList", e))
            }
        });
        let addresses = try_join_all(calls).await?;
        Ok(addresses.into_iter().filter(|a| !a.is_zero()).collect())
    }

    async fn provider_status(&self, provider: Address) -> ChainResult<ProviderStatus> {
        let (index, since_block, activated_ts, disabled_block, disabled_ts, paused) = self
            .manager()
            .providers(provider)
            .call()
            .await
            .map_err(|e| ChainError::call("providers", e))?;
        Ok(ProviderStatus {
            index: index.low_u64(),
            activated_since_block: since_block.low_u64(),
            activated_timestamp: activated_ts.low_u64() as i64,
            disabled_since_block: disabled_block.low_u64(),
            disabled_timestamp: disabled_ts.low_u64() as i64,
            paused,
        })
    }

    async fn provider_info(&self, provider: Address) -> ChainResult<ProviderInfo> {
        let (term, token, amount, per_feed, feed_size, ip) = self
            .manager()
            .provider_info(provider)
            .call()
            .await
            .map_err(|e| ChainError::call("providerInfo", e))?;
        let whitelisted_ip = ethers::utils::parse_bytes32_string(&ip)
            .map(|s| s.to_string())
            .unwrap_or_default();
        Ok(ProviderInfo {
            payment_term_block_count: term.low_u64(),
            payment_token_address: token,
            payment_amount: amount,
            block_count_per_feed: per_feed.low_u64(),
            feed_size: feed_size.low_u64(),
            whitelisted_ip,
        })
    }

    async fn activated_tabs(&self) -> ChainResult<Vec<TabCode>> {
        let registry = self.registry();
        let count = registry
            .activated_tab_count()
            .call()
            .await
            .map_err(|e| ChainError::call("activatedTabCount", e))?;
        let calls = (0..count.low_u64()).map(|i| {
            let registry = registry.clone();
            async move {
                registry
                    .tab_list(U256::from(i))
                    .call()
                    .await
                    .map_err(|e| ChainError::call("tabList", e))
            }
        });
        let raw = try_join_all(calls).await?;
        Ok(raw.into_iter().filter_map(TabCode::from_bytes).collect())
    }

    async fn is_frozen(&self, tab: TabCode) -> ChainResult<bool> {
        self.registry()
            .frozen_tabs(tab.as_bytes())
            .call()
            .await
            .map_err(|e| ChainError::call("frozenTabs", e))
    }

    async fn depegged_tabs(&self) -> ChainResult<Vec<TabCode>> {
        let raw = self
            .registry()
            .get_ctrl_alt_del_tab_list()
            .call()
            .await
            .map_err(|e| ChainError::call("getCtrlAltDelTabList", e))?;
        Ok(raw.into_iter().filter_map(TabCode::from_bytes).collect())
    }

    async fn tab_params(&self, tab: TabCode) -> ChainResult<TabParams> {
        let Some(address) = self.tab_config else {
            return Ok(TabParams::default());
        };
        let (risk_penalty, fee_rate, min_reserve, liquidation) =
            TabConfigContract::new(address, self.provider.clone())
                .tab_params(tab.as_bytes())
                .call()
                .await
                .map_err(|e| ChainError::call("tabParams", e))?;
        Ok(TabParams {
            risk_penalty_per_frame: risk_penalty.low_u64(),
            process_fee_rate: fee_rate.low_u64(),
            min_reserve_ratio: min_reserve.low_u64(),
            liquidation_ratio: liquidation.low_u64(),
        })
    }
}

#[async_trait]
impl ChainWriter for EthersChain {
    async fn enable_tab(&self, tab: TabCode) -> ChainResult<H256> {
        let contract = TabRegistryContract::new(self.tab_registry, self.keeper("enableTab")?);
        tracing::info!(tab = %tab, "Submitting enableTab transaction");
        self.confirm("enableTab", contract.enable_tab(tab.as_bytes()))
            .await
    }

    async fn disable_tab(&self, tab: TabCode) -> ChainResult<H256> {
        let contract = TabRegistryContract::new(self.tab_registry, self.keeper("disableTab")?);
        tracing::info!(tab = %tab, "Submitting disableTab transaction");
        self.confirm("disableTab", contract.disable_tab(tab.as_bytes()))
            .await
    }

    async fn submit_provider_feed_count(
        &self,
        providers: [Address; FEED_COUNT_CHUNK],
        feed_counts: [U256; FEED_COUNT_CHUNK],
        timestamp: U256,
    ) -> ChainResult<H256> {
        let contract = PriceOracleManagerContract::new(
            self.oracle_manager,
            self.keeper("submitProviderFeedCount")?,
        );
        self.confirm(
            "submitProviderFeedCount",
            contract.submit_provider_feed_count(providers, feed_counts, timestamp),
        )
        .await
    }
}

#[async_trait]
impl NonceSource for EthersChain {
    async fn nonce_of(&self, user: Address) -> ChainResult<U256> {
        PriceOracleContract::new(self.price_oracle, self.provider.clone())
            .nonces(user)
            .call()
            .await
            .map_err(|e| ChainError::call("nonces", e))
    }
}
