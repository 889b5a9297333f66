//! Configuration management for the tab oracle
//!
//! Loads optional config files + `TAB_ORACLE__*` environment variables, with
//! secrets read from the environment (or a `.env` file).

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub oracle: OracleConfig,
    pub chain: ChainConfig,
    pub archive: ArchiveConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
    /// Pegged currencies seeded into the store at startup
    #[serde(default)]
    pub pegs: Vec<PegConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    /// Deployment environment; `local` also runs the performance reporter every cycle
    pub node_env: String,
    /// Seconds after which the active median is refreshed regardless of movement
    pub inactive_period_secs: u64,
    /// Publication threshold in 1/10000 of a percent point (500 = 0.05%)
    pub movement_delta: u64,
    /// Wrapped reserve token symbols accepted from providers
    pub wrapped_reserve_symbols: Vec<String>,
    /// Reserve symbol used by attestations when the caller names none
    pub default_reserve_symbol: String,
    /// Tab codes highlighted by the live quotes read
    pub popular_tabs: Vec<String>,
    /// Lower bound of the first batch window and of the first performance report
    pub genesis: DateTime<Utc>,
    /// Extra seconds beyond the inactive period a live quote stays visible
    pub live_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC endpoint
    pub rpc_url: String,
    pub chain_id: u64,
    pub oracle_manager_contract: String,
    pub tab_registry_contract: String,
    /// Verifying contract of signed attestations
    pub price_oracle_contract: String,
    /// Per-tab risk parameters; reads return defaults when unset
    pub tab_config_contract: Option<String>,
    /// Gas limit of keeper transactions
    pub gas_limit: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Archive each batch's contributing submissions
    pub enabled: bool,
    /// Data directory
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between aggregation cycles
    pub cycle_interval_secs: u64,
    /// Seconds between provider performance reports
    pub performance_interval_secs: u64,
    /// Age after which the params cache is treated as stale
    pub params_staleness_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PegConfig {
    pub pegged_tab: String,
    pub peg_to_tab: String,
    /// Percent of the source rate
    pub peg_to_ratio: u32,
}

/// Secrets kept out of config files
#[derive(Clone)]
pub struct Secrets {
    pub keeper_private_key: String,
    pub signer_private_key: String,
    pub auth_secret: String,
    pub private_token: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secrets(..)")
    }
}

const SECRET_VARS: [&str; 4] = [
    "KEEPER_PRIVATE_KEY",
    "SIGNER_PRIVATE_KEY",
    "AUTH_SECRET",
    "PRIVATE_TOKEN",
];

fn check_private_key(var: &str, value: &str) -> Result<()> {
    if !value.starts_with("0x") || value.len() != 66 {
        bail!("{} must be a hex string with 0x prefix (66 chars total)", var);
    }
    Ok(())
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Oracle defaults
            .set_default("oracle.node_env", "production")?
            .set_default("oracle.inactive_period_secs", 3600)?
            .set_default("oracle.movement_delta", 500)?
            .set_default("oracle.wrapped_reserve_symbols", vec!["CBBTC", "WBTC"])?
            .set_default("oracle.default_reserve_symbol", "CBBTC")?
            .set_default("oracle.popular_tabs", vec!["USD", "EUR", "JPY", "MYR"])?
            .set_default("oracle.genesis", "2024-03-18T03:28:05.635Z")?
            .set_default("oracle.live_grace_secs", 300)?
            // Chain defaults
            .set_default("chain.rpc_url", "http://127.0.0.1:8545")?
            .set_default("chain.chain_id", 31337)?
            .set_default("chain.oracle_manager_contract", "")?
            .set_default("chain.tab_registry_contract", "")?
            .set_default("chain.price_oracle_contract", "")?
            .set_default("chain.gas_limit", 10_000_000)?
            // Archive defaults
            .set_default("archive.enabled", true)?
            .set_default("archive.data_dir", "./data")?
            // Scheduler defaults
            .set_default("scheduler.cycle_interval_secs", 300)?
            .set_default("scheduler.performance_interval_secs", 3600)?
            .set_default("scheduler.params_staleness_secs", 600)?
            // Logging defaults
            .set_default("logging.json", false)?
            .set_default("logging.level", "info")?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (TAB_ORACLE__*)
            .add_source(
                Environment::with_prefix("TAB_ORACLE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("oracle.wrapped_reserve_symbols")
                    .with_list_parse_key("oracle.popular_tabs")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    pub fn is_local(&self) -> bool {
        self.oracle.node_env == "local"
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "env={} chain_id={} cycle={}s inactive={}s movement_delta={} reserves={:?} pegs={}",
            self.oracle.node_env,
            self.chain.chain_id,
            self.scheduler.cycle_interval_secs,
            self.oracle.inactive_period_secs,
            self.oracle.movement_delta,
            self.oracle.wrapped_reserve_symbols,
            self.pegs.len()
        )
    }

    /// Validate required environment variables and contract addresses
    pub fn validate_env(&self) -> Result<Secrets> {
        for var in SECRET_VARS {
            if std::env::var(var).map(|v| v.is_empty()).unwrap_or(true) {
                bail!("Required environment variable {} is not set", var);
            }
        }

        let keeper_private_key = std::env::var("KEEPER_PRIVATE_KEY")?;
        check_private_key("KEEPER_PRIVATE_KEY", &keeper_private_key)?;
        let signer_private_key = std::env::var("SIGNER_PRIVATE_KEY")?;
        check_private_key("SIGNER_PRIVATE_KEY", &signer_private_key)?;

        for (name, value) in [
            ("chain.oracle_manager_contract", &self.chain.oracle_manager_contract),
            ("chain.tab_registry_contract", &self.chain.tab_registry_contract),
            ("chain.price_oracle_contract", &self.chain.price_oracle_contract),
        ] {
            if value.is_empty() {
                bail!("{} must be configured", name);
            }
        }

        Ok(Secrets {
            keeper_private_key,
            signer_private_key,
            auth_secret: std::env::var("AUTH_SECRET")?,
            private_token: std::env::var("PRIVATE_TOKEN")?,
        })
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_key_format() {
        let key = format!("0x{}", "ab".repeat(32));
        assert!(check_private_key("KEY", &key).is_ok());
        assert!(check_private_key("KEY", &key[2..]).is_err());
        assert!(check_private_key("KEY", "0x1234").is_err());
    }

    #[test]
    fn secrets_are_not_printed() {
        let secrets = Secrets {
            keeper_private_key: "k".to_string(),
            signer_private_key: "s".to_string(),
            auth_secret: "a".to_string(),
            private_token: "p".to_string(),
        };
        assert_eq!(format!("{:?}", secrets), "Secrets(..)");
    }
}
