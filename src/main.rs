//! Tab Oracle - median price oracle keeper
//!
//! Runs the aggregation cycle and the provider performance reporter on their
//! schedules until interrupted.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use tab_oracle::aggregation::{CycleOutcome, MedianCycle};
use tab_oracle::api::OracleService;
use tab_oracle::archive::{CsvSnapshotArchive, SnapshotArchive};
use tab_oracle::attestation::AttestationService;
use tab_oracle::auth::ApiTokenCodec;
use tab_oracle::cache::{OracleParams, ParamsCache};
use tab_oracle::chain::EthersChain;
use tab_oracle::config::{AppConfig, LoggingConfig, PegConfig};
use tab_oracle::performance::PerformanceReporter;
use tab_oracle::store::{MemoryStore, OracleStore, PeggedTab};
use tab_oracle::types::TabCode;

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(fmt::layer().json().with_current_span(false)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

async fn seed_pegs(store: &dyn OracleStore, pegs: &[PegConfig]) -> Result<()> {
    for peg in pegs {
        let pegged_tab = TabCode::parse(&peg.pegged_tab)
            .with_context(|| format!("Invalid pegged tab {}", peg.pegged_tab))?;
        let peg_to_tab = TabCode::parse(&peg.peg_to_tab)
            .with_context(|| format!("Invalid peg target {}", peg.peg_to_tab))?;
        if store.pegged_tab(pegged_tab).await?.is_some() {
            continue;
        }
        store
            .insert_pegged_tab(PeggedTab {
                id: Uuid::new_v4(),
                pegged_tab,
                peg_to_tab,
                peg_to_ratio: peg.peg_to_ratio,
            })
            .await?;
        tracing::info!(pegged = %pegged_tab, peg_to = %peg_to_tab, ratio = peg.peg_to_ratio, "Peg seeded");
    }
    Ok(())
}

async fn run_cycle(cycle: &MedianCycle, cache: &ParamsCache, chain: &EthersChain, store: &dyn OracleStore) {
    let refreshed_at = Utc::now();
    if cache.is_stale(refreshed_at).await {
        if let Err(e) = cache.refresh(store, chain, refreshed_at).await {
            tracing::warn!(error = %e, "Params cache refresh failed");
        }
    }

    // Batch time bounds the window, so it is taken once the refresh is done
    match cycle.run(Utc::now()).await {
        Ok(CycleOutcome::Completed(report)) => tracing::info!(
            batch = %report.batch_id,
            medians = report.medians,
            published = report.published,
            pegged = report.pegged,
            failed = report.failed.len(),
            cid = %report.cid,
            "Median cycle completed"
        ),
        Ok(CycleOutcome::NoData) => tracing::info!("No submissions since the previous batch"),
        Ok(CycleOutcome::Skipped) => tracing::warn!("Median cycle still running, trigger skipped"),
        Err(e) => tracing::error!(error = %e, "Median cycle failed"),
    }
}

async fn run_report(reporter: &PerformanceReporter) {
    match reporter.report(Utc::now()).await {
        Ok(records) => tracing::info!(chunks = records.len(), "Provider performance reported"),
        Err(e) => tracing::error!(error = %e, "Provider performance report failed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;
    init_tracing(&config.logging);
    tracing::info!(config = %config, "Starting tab oracle");

    let secrets = config.validate_env()?;
    let local = config.is_local();
    let params = OracleParams::from_config(&config);

    let store: Arc<dyn OracleStore> = Arc::new(MemoryStore::new());
    let chain = Arc::new(
        EthersChain::new(&config.chain, Some(&secrets.keeper_private_key))
            .context("Failed to connect to chain")?,
    );
    seed_pegs(store.as_ref(), &config.pegs).await?;

    let cache = Arc::new(ParamsCache::new(
        params.clone(),
        config.scheduler.params_staleness_secs,
    ));
    cache
        .refresh(store.as_ref(), chain.as_ref(), Utc::now())
        .await
        .context("Initial params refresh failed")?;

    let archive: Option<Arc<dyn SnapshotArchive>> = if local || !config.archive.enabled {
        None
    } else {
        Some(Arc::new(
            CsvSnapshotArchive::new(&config.archive.data_dir).context("Failed to open snapshot archive")?,
        ))
    };
    let cycle = MedianCycle::new(store.clone(), chain.clone(), archive, params.clone());
    let reporter = PerformanceReporter::new(store.clone(), chain.clone(), cache.clone());

    let attestation = AttestationService::new(
        store.clone(),
        chain.clone(),
        &secrets.signer_private_key,
        config.chain.chain_id,
        &config.chain.price_oracle_contract,
        &params,
    )?;
    tracing::info!(owner = %format!("{:#x}", attestation.owner()), "Attestation signer ready");

    let codec = ApiTokenCodec::new(&secrets.auth_secret)?;
    let private_token = codec.hash(&secrets.private_token);
    let service = OracleService::new(store.clone(), cache.clone(), codec, private_token, attestation);
    let tabs = service.tab_list(Utc::now()).await;
    if let Some(error) = tabs.error_message() {
        tracing::warn!(error = %error, "Tab registry unavailable");
    }

    let mut cycle_timer = interval(Duration::from_secs(config.scheduler.cycle_interval_secs));
    cycle_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut report_timer = interval(Duration::from_secs(config.scheduler.performance_interval_secs));
    report_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first report waits a full period
    report_timer.tick().await;

    loop {
        tokio::select! {
            _ = cycle_timer.tick() => {
                run_cycle(&cycle, &cache, &chain, store.as_ref()).await;
                if local {
                    run_report(&reporter).await;
                }
            }
            _ = report_timer.tick(), if !local => {
                run_report(&reporter).await;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                break;
            }
        }
    }

    Ok(())
}
