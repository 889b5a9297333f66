//! End-to-end tests for the aggregation cycle, attestation and service facade

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::{Address, H256, U256};
    use ethers::utils::to_checksum;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::{json, Value};
    use std::str::FromStr;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    use tab_oracle::aggregation::{current_rate, CycleOutcome, CycleReport, MedianCycle};
    use tab_oracle::api::{OracleService, StatusClass};
    use tab_oracle::attestation::AttestationService;
    use tab_oracle::auth::ApiTokenCodec;
    use tab_oracle::cache::{OracleParams, ParamsCache};
    use tab_oracle::chain::{
        ChainReader, ChainResult, ChainWriter, NonceSource, ProviderInfo, ProviderStatus,
        TabParams, FEED_COUNT_CHUNK,
    };
    use tab_oracle::feed::{save_feeds, FeedEnvelope, RequestMeta};
    use tab_oracle::store::{FeedProvider, MedianPrice, MemoryStore, OracleStore, PeggedTab, TabRegistry};
    use tab_oracle::types::{TabCode, TabStatus};

    const SIGNER_KEY: &str = "0x59c6995e998f97a5a0044966f0945387dc9f5a59e86cdc84e64546a1d8f76d59";
    const PROVIDER_KEY: &str = "0x8b3a350cf5c34c9194ca85829a2df0ec3153be0318b5e2d3348e872092edffba";
    const BTC_USD: &str = "100000000000000000000000";
    const BTC_JPY: &str = "15000000000000000000000000";

    // ============================================================================
    // Chain fakes
    // ============================================================================

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Enable(TabCode),
        Disable(TabCode),
    }

    #[derive(Default)]
    struct RecordingWriter {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingWriter {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChainWriter for RecordingWriter {
        async fn enable_tab(&self, tab: TabCode) -> ChainResult<H256> {
            self.calls.lock().unwrap().push(Call::Enable(tab));
            Ok(H256::repeat_byte(1))
        }

        async fn disable_tab(&self, tab: TabCode) -> ChainResult<H256> {
            self.calls.lock().unwrap().push(Call::Disable(tab));
            Ok(H256::repeat_byte(2))
        }

        async fn submit_provider_feed_count(
            &self,
            _providers: [Address; FEED_COUNT_CHUNK],
            _feed_counts: [U256; FEED_COUNT_CHUNK],
            _timestamp: U256,
        ) -> ChainResult<H256> {
            Ok(H256::repeat_byte(3))
        }
    }

    struct FixedNonce(u64);

    #[async_trait]
    impl NonceSource for FixedNonce {
        async fn nonce_of(&self, _user: Address) -> ChainResult<U256> {
            Ok(U256::from(self.0))
        }
    }

    /// One active provider; no tabs activated on chain
    struct SingleProviderChain {
        provider: Address,
    }

    #[async_trait]
    impl ChainReader for SingleProviderChain {
        async fn provider_addresses(&self) -> ChainResult<Vec<Address>> {
            Ok(vec![self.provider])
        }

        async fn provider_status(&self, _provider: Address) -> ChainResult<ProviderStatus> {
            Ok(ProviderStatus::default())
        }

        async fn provider_info(&self, _provider: Address) -> ChainResult<ProviderInfo> {
            Ok(ProviderInfo {
                feed_size: 2,
                whitelisted_ip: "10.0.0.1".to_string(),
                ..Default::default()
            })
        }

        async fn activated_tabs(&self) -> ChainResult<Vec<TabCode>> {
            Ok(Vec::new())
        }

        async fn is_frozen(&self, _tab: TabCode) -> ChainResult<bool> {
            Ok(false)
        }

        async fn depegged_tabs(&self) -> ChainResult<Vec<TabCode>> {
            Ok(Vec::new())
        }

        async fn tab_params(&self, _tab: TabCode) -> ChainResult<TabParams> {
            Ok(TabParams::default())
        }
    }

    // ============================================================================
    // Harness
    // ============================================================================

    fn code(s: &str) -> TabCode {
        TabCode::parse(s).unwrap()
    }

    struct Harness {
        store: Arc<MemoryStore>,
        writer: Arc<RecordingWriter>,
        cycle: MedianCycle,
        providers: Vec<FeedProvider>,
        clock: DateTime<Utc>,
    }

    impl Harness {
        async fn new(provider_count: u8) -> Self {
            let store = Arc::new(MemoryStore::new());
            let writer = Arc::new(RecordingWriter::default());
            let clock = Utc::now() - Duration::hours(1);
            let mut providers = Vec::new();
            for byte in 1..=provider_count {
                let provider = store
                    .upsert_provider(FeedProvider::new(Address::repeat_byte(byte), clock))
                    .await
                    .unwrap();
                providers.push(provider);
            }
            let cycle = MedianCycle::with_rng(
                store.clone(),
                writer.clone(),
                None,
                OracleParams::default(),
                StdRng::seed_from_u64(7),
            );
            Self {
                store,
                writer,
                cycle,
                providers,
                clock,
            }
        }

        async fn enable_tab(&self, tab: &str) {
            let mut row = TabRegistry::new(code(tab));
            row.is_tab = true;
            self.store.upsert_tab(row).await.unwrap();
        }

        async fn submit(&mut self, index: usize, quotes: Value, wrapped: Value) {
            self.clock = self.clock + Duration::seconds(1);
            let provider = &self.providers[index];
            let raw = json!({
                "data": {
                    "provider": format!("{:#x}", provider.pub_address),
                    "timestamp": self.clock.timestamp(),
                    "quotes": quotes,
                    "wrapped_reserves": wrapped
                },
                "signature": "0x"
            })
            .to_string();
            let feed = FeedEnvelope::parse(&raw).unwrap().feed().unwrap();
            save_feeds(
                self.store.as_ref(),
                &OracleParams::default(),
                provider,
                &feed,
                &raw,
                self.clock,
            )
            .await
            .unwrap();
        }

        async fn submit_jpy(&mut self, index: usize, jpy: &str) {
            self.submit(index, json!({"USDBTC": "0.00001", "USDJPY": jpy}), json!({}))
                .await;
        }

        async fn run(&mut self) -> CycleReport {
            self.clock = self.clock + Duration::seconds(1);
            match self.cycle.run(self.clock).await.unwrap() {
                CycleOutcome::Completed(report) => report,
                other => panic!("expected a completed batch, got {:?}", other),
            }
        }

        async fn median(&self, report: &CycleReport, pair: &str) -> MedianPrice {
            self.store
                .batch_median(report.batch_id, "BTC", pair)
                .await
                .unwrap()
                .unwrap()
        }

        /// One batch in which the first `count` providers quote JPY
        async fn jpy_batch(&mut self, count: usize) -> TabStatus {
            for index in 0..count {
                self.submit_jpy(index, "150").await;
            }
            let report = self.run().await;
            self.median(&report, "JPY").await.tab_status.unwrap()
        }
    }

    // ============================================================================
    // Pool construction
    // ============================================================================

    #[tokio::test]
    async fn test_latest_submission_per_provider_counts_once() {
        let mut h = Harness::new(3).await;
        h.submit_jpy(0, "150").await;
        h.submit_jpy(1, "151").await;
        h.submit_jpy(2, "152").await;
        // supersedes provider 0's earlier quote
        h.submit_jpy(0, "160").await;

        let report = h.run().await;
        let jpy = h.median(&report, "JPY").await;
        assert_eq!(jpy.active_slot, 3);
        assert_eq!(jpy.slots.len(), 3);
        assert_eq!(jpy.median_value.to_string(), "15200000000000000000000000");
        assert!(jpy.feeds.is_none());
    }

    #[tokio::test]
    async fn test_large_pool_is_trimmed_with_audit() {
        let mut h = Harness::new(12).await;
        h.enable_tab("JPY").await;
        for index in 0..12 {
            h.submit_jpy(index, &(141 + index).to_string()).await;
        }

        let report = h.run().await;
        let jpy = h.median(&report, "JPY").await;
        assert_eq!(jpy.active_slot, 9);
        assert_eq!(jpy.slots.len(), 9);
        assert!(jpy.slots.iter().all(|s| s.price_pair_id.is_some()));

        let feeds = jpy.feeds.expect("trimmed pool keeps its audit trail");
        let audit: Vec<&str> = feeds.split(',').collect();
        assert_eq!(audit.len(), 12);
        assert_eq!(audit[0], "14100000000000000000000000");
        assert_eq!(audit[11], "15200000000000000000000000");
        assert!(audit.contains(&jpy.median_value.to_string().as_str()));
    }

    #[tokio::test]
    async fn test_enabled_tab_slots_are_padded() {
        let mut h = Harness::new(4).await;
        h.enable_tab("JPY").await;
        for index in 0..4 {
            h.submit_jpy(index, "150").await;
        }

        let report = h.run().await;
        let jpy = h.median(&report, "JPY").await;
        assert_eq!(jpy.active_slot, 4);
        assert_eq!(jpy.slots.len(), 9);
        assert!(jpy.slots[4..].iter().all(|s| s.price_pair_id.is_none()));

        // reference currencies keep their natural length
        let usd = h.median(&report, "USD").await;
        assert_eq!(usd.slots.len(), 4);
    }

    // ============================================================================
    // Tab health
    // ============================================================================

    #[tokio::test]
    async fn test_tab_freezes_after_three_thin_batches() {
        let mut h = Harness::new(3).await;
        h.enable_tab("JPY").await;

        assert_eq!(h.jpy_batch(1).await, TabStatus::Missing);
        assert_eq!(h.jpy_batch(1).await, TabStatus::Missing);
        assert_eq!(h.jpy_batch(1).await, TabStatus::Frozen);
        assert_eq!(h.jpy_batch(2).await, TabStatus::Frozen);

        assert_eq!(h.writer.calls(), vec![Call::Disable(code("JPY"))]);
        let row = h.store.tab(code("JPY")).await.unwrap().unwrap();
        assert!(row.frozen);
    }

    #[tokio::test]
    async fn test_frozen_tab_revives_after_three_healthy_batches() {
        let mut h = Harness::new(3).await;
        h.enable_tab("JPY").await;
        for _ in 0..3 {
            h.jpy_batch(1).await;
        }

        assert_eq!(h.jpy_batch(3).await, TabStatus::Recovering);
        assert_eq!(h.jpy_batch(3).await, TabStatus::Recovering);
        assert_eq!(h.jpy_batch(3).await, TabStatus::Active);
        assert_eq!(h.jpy_batch(3).await, TabStatus::Active);

        assert_eq!(
            h.writer.calls(),
            vec![Call::Disable(code("JPY")), Call::Enable(code("JPY"))]
        );
        let row = h.store.tab(code("JPY")).await.unwrap().unwrap();
        assert!(!row.frozen);
        assert_eq!(row.missing_count, 0);
        assert_eq!(row.revival_count, 0);
    }

    #[tokio::test]
    async fn test_reference_currency_never_touches_chain() {
        let mut h = Harness::new(1).await;
        for _ in 0..4 {
            h.jpy_batch(1).await;
        }
        assert!(h.writer.calls().is_empty());
    }

    // ============================================================================
    // Publication and pegs
    // ============================================================================

    #[tokio::test]
    async fn test_unchanged_median_is_not_republished() {
        let mut h = Harness::new(3).await;
        for index in 0..3 {
            h.submit_jpy(index, "150").await;
        }
        let first = h.run().await;
        assert_eq!(first.published, 2);
        let published = h.median(&first, "JPY").await;

        for index in 0..3 {
            h.submit_jpy(index, "150").await;
        }
        let second = h.run().await;
        assert_eq!(second.medians, 2);
        assert_eq!(second.published, 0);

        let audit = h.median(&second, "JPY").await;
        assert!(!audit.refresh_median);
        assert_eq!(audit.movement_delta.to_string(), "0");
        assert_eq!(audit.overwritten_median.to_string(), BTC_JPY);

        let active = h.store.latest_active_median("JPY").await.unwrap().unwrap();
        assert_eq!(active.median_price_id, published.id);
        assert_eq!(active.last_updated, first.created_datetime);
    }

    #[tokio::test]
    async fn test_pegged_tab_follows_its_source() {
        let mut h = Harness::new(3).await;
        h.store
            .insert_pegged_tab(PeggedTab {
                id: Uuid::new_v4(),
                pegged_tab: code("XAU"),
                peg_to_tab: code("JPY"),
                peg_to_ratio: 50,
            })
            .await
            .unwrap();
        for index in 0..3 {
            h.submit_jpy(index, "150").await;
        }

        let report = h.run().await;
        assert_eq!(report.pegged, 1);
        let (active, xau) = current_rate(h.store.as_ref(), "XAU").await.unwrap().unwrap();
        assert_eq!(xau.median_value.to_string(), "7500000000000000000000000");
        assert_eq!(active.last_updated, report.created_datetime);
        assert_eq!(xau.median_batch_id, report.batch_id);
    }

    // ============================================================================
    // Attestation
    // ============================================================================

    #[tokio::test]
    async fn test_signed_price_from_published_batch() {
        let mut h = Harness::new(3).await;
        for index in 0..3 {
            h.submit(
                index,
                json!({"USDBTC": "0.00001", "USDJPY": "150"}),
                json!({"CBBTC": "99000"}),
            )
            .await;
        }
        let report = h.run().await;
        assert_eq!(report.medians, 3);

        let (_, usd) = current_rate(h.store.as_ref(), "USD").await.unwrap().unwrap();
        assert_eq!(usd.median_value.to_string(), BTC_USD);

        let service = AttestationService::new(
            h.store.clone(),
            Arc::new(FixedNonce(7)),
            SIGNER_KEY,
            31337,
            "0x0909090909090909090909090909090909090909",
            &OracleParams::default(),
        )
        .unwrap();
        let updater = Address::repeat_byte(0x42);
        let signed = service
            .signed_median_price(updater, "JPY", None)
            .await
            .unwrap();

        assert_eq!(signed.timestamp, report.created_datetime.timestamp_millis());
        let quote = &signed.quotes["BTCJPY"];
        assert_eq!(quote.reserve_symbol, "CBBTC");
        assert_eq!(quote.btc_to_tab, BTC_JPY);
        assert_eq!(quote.median, "14850000000000000000000000");
        assert_eq!(quote.signed.nonce, "7");
        assert_eq!(quote.signed.owner, to_checksum(&service.owner(), None));
        assert_eq!(quote.signed.updater, to_checksum(&updater, None));
    }

    // ============================================================================
    // Service facade
    // ============================================================================

    async fn signed_body(wallet: &LocalWallet, data: Value) -> String {
        let data = data.to_string();
        let signature = wallet.sign_message(data.as_bytes()).await.unwrap();
        format!(r#"{{"data":{},"signature":"0x{}"}}"#, data, signature)
    }

    #[tokio::test]
    async fn test_token_reset_then_feed_submission() {
        let wallet = LocalWallet::from_str(PROVIDER_KEY).unwrap();
        let address = wallet.address();
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(ParamsCache::new(OracleParams::default(), 600));
        cache
            .refresh(store.as_ref(), &SingleProviderChain { provider: address }, Utc::now())
            .await
            .unwrap();

        let codec = ApiTokenCodec::new("auth-secret").unwrap();
        let private_token = codec.hash("private");
        let attestation = AttestationService::new(
            store.clone(),
            Arc::new(FixedNonce(0)),
            SIGNER_KEY,
            31337,
            "0x0909090909090909090909090909090909090909",
            &OracleParams::default(),
        )
        .unwrap();
        let service = OracleService::new(store.clone(), cache, codec, private_token, attestation);

        // no token issued yet
        let now = Utc::now();
        let meta = RequestMeta {
            real_ip: Some("10.0.0.1".to_string()),
            api_token: None,
        };
        let reset_body = signed_body(
            &wallet,
            json!({"provider": format!("{:#x}", address), "timestamp": now.timestamp()}),
        )
        .await;
        let feed_body = signed_body(
            &wallet,
            json!({
                "provider": format!("{:#x}", address),
                "timestamp": now.timestamp(),
                "quotes": {"USDBTC": "0.00001", "USDJPY": "150"}
            }),
        )
        .await;
        let rejected = service.submit_feed(address, &meta, &feed_body, now).await;
        assert_eq!(rejected.status, StatusClass::Unauthorized);

        let issued = service.reset_api_token(address, &meta, &reset_body, now).await;
        assert!(issued.is_ok());
        let issued = serde_json::to_value(&issued).unwrap();
        assert_eq!(issued["timestamp"], json!(now.timestamp()));
        let api_token = issued["data"]["api_token"].as_str().unwrap().to_string();

        let authed = RequestMeta {
            api_token: Some(api_token),
            ..meta.clone()
        };
        let accepted = service.submit_feed(address, &authed, &feed_body, now).await;
        assert!(accepted.is_ok());
        let accepted = serde_json::to_value(&accepted).unwrap();
        assert_eq!(accepted["data"]["processed_count"], json!(2));

        // replaying the same feed timestamp is outdated
        let replay = service.submit_feed(address, &authed, &feed_body, now).await;
        assert_eq!(replay.status, StatusClass::BadRequest);
        assert_eq!(replay.error_message(), Some("Outdated feed"));

        // private reads need the private token
        let denied = service.provider_list(&authed, now).await;
        assert_eq!(denied.status, StatusClass::Unauthorized);
        let private = RequestMeta {
            api_token: Some("private".to_string()),
            ..meta
        };
        let directory = service.provider_list(&private, now).await;
        assert!(directory.is_ok());
    }
}
