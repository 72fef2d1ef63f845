//! Submitter configuration.
//!
//! Settings are read from `./config/*.json`, then from the JSON files listed in
//! `CONFIG_FILES`, then from `SUBMITTER_`-prefixed environment variables, with later
//! sources overriding earlier ones. Nested keys use `__` in environment variables, e.g.
//! `SUBMITTER_GAS__FEE_BUMP_PERCENT=20`.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use ethers::types::Address;
use eyre::{eyre, Context, Result};
use serde::Deserialize;

use crate::trace::TracingConfig;

const GWEI: u64 = 1_000_000_000;
const DEFAULT_MAX_BASE_FEE: u64 = 100 * GWEI;

/// Top level settings of the submitter service.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitterSettings {
    /// RPC endpoints in priority order
    pub rpc_urls: Vec<String>,
    pub chain_id: u64,
    pub entry_point: Address,
    /// Hex encoded private keys of the executor EOAs
    pub executor_keys: Vec<String>,
    /// Location of the receipt database. Receipts are kept in memory when unset.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub tracing: TracingConfig,
    #[serde(default)]
    pub limits: LimitsSettings,
    #[serde(default)]
    pub gas: GasSettings,
    #[serde(default)]
    pub tuning: TuningSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsSettings {
    /// Max boops held by a single nonce track
    pub buffer_limit: usize,
    /// Max boops held across all tracks
    pub max_capacity: usize,
}

impl Default for LimitsSettings {
    fn default() -> Self {
        Self {
            buffer_limit: 50,
            max_capacity: 10_000,
        }
    }
}

/// Gas and fee parameters. Percentages are whole numbers, fees are in wei.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GasSettings {
    /// Margin added to simulated gas limits of sponsored boops
    pub gas_safety_margin: u32,
    pub base_fee_margin: u32,
    /// Smallest margin over the base fee a max fee may have
    pub min_base_fee_margin: u32,
    pub fee_bump_percent: u32,
    pub max_base_fee: u64,
    pub initial_priority_fee: u64,
    pub max_priority_fee: u64,
    /// Gas the entry point needs on top of the boop's own gas limit
    pub entry_point_gas_buffer: u32,
}

impl Default for GasSettings {
    fn default() -> Self {
        Self {
            gas_safety_margin: 20,
            base_fee_margin: 20,
            min_base_fee_margin: 5,
            fee_bump_percent: 15,
            max_base_fee: DEFAULT_MAX_BASE_FEE,
            initial_priority_fee: 1,
            max_priority_fee: 1000,
            entry_point_gas_buffer: 70_000,
        }
    }
}

/// Timings of the submission pipeline, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TuningSettings {
    pub max_submit_pending_time_ms: u64,
    pub stuck_tx_wait_time_ms: u64,
    pub receipt_timeout_ms: u64,
    pub receipt_poll_interval_ms: u64,
    pub rpc_request_timeout_ms: u64,
    pub max_rpc_retries: usize,
    pub simulation_cache_size: u64,
    pub simulation_cache_ttl_ms: u64,
}

impl Default for TuningSettings {
    fn default() -> Self {
        Self {
            max_submit_pending_time_ms: 60_000,
            stuck_tx_wait_time_ms: 3_000,
            receipt_timeout_ms: 10_000,
            receipt_poll_interval_ms: 100,
            rpc_request_timeout_ms: 3_000,
            max_rpc_retries: 3,
            simulation_cache_size: 10_000,
            simulation_cache_ttl_ms: 300_000,
        }
    }
}

impl TuningSettings {
    pub fn max_submit_pending_time(&self) -> Duration {
        Duration::from_millis(self.max_submit_pending_time_ms)
    }

    pub fn stuck_tx_wait_time(&self) -> Duration {
        Duration::from_millis(self.stuck_tx_wait_time_ms)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_millis(self.receipt_timeout_ms)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }

    pub fn rpc_request_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_request_timeout_ms)
    }

    pub fn simulation_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.simulation_cache_ttl_ms)
    }
}

impl SubmitterSettings {
    /// Rejects settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.rpc_urls.is_empty() {
            return Err(eyre!("At least one RPC url is required"));
        }
        if self.executor_keys.is_empty() {
            return Err(eyre!("At least one executor key is required"));
        }
        if self.limits.buffer_limit == 0 {
            return Err(eyre!("limits.buffer_limit must be positive"));
        }
        if self.limits.max_capacity < self.limits.buffer_limit {
            return Err(eyre!(
                "limits.max_capacity ({}) must be at least limits.buffer_limit ({})",
                self.limits.max_capacity,
                self.limits.buffer_limit
            ));
        }
        let gas = &self.gas;
        if gas.base_fee_margin < 10 {
            return Err(eyre!("gas.base_fee_margin must be at least 10"));
        }
        if gas.fee_bump_percent < 10 {
            return Err(eyre!("gas.fee_bump_percent must be at least 10"));
        }
        if gas.min_base_fee_margin > gas.base_fee_margin {
            return Err(eyre!(
                "gas.min_base_fee_margin must not exceed gas.base_fee_margin"
            ));
        }
        if gas.initial_priority_fee > gas.max_priority_fee {
            return Err(eyre!(
                "gas.initial_priority_fee must not exceed gas.max_priority_fee"
            ));
        }
        let tuning = &self.tuning;
        if tuning.receipt_poll_interval_ms == 0 {
            return Err(eyre!("tuning.receipt_poll_interval_ms must be positive"));
        }
        if tuning.stuck_tx_wait_time_ms == 0
            || tuning.stuck_tx_wait_time_ms > tuning.max_submit_pending_time_ms
        {
            return Err(eyre!(
                "tuning.stuck_tx_wait_time_ms must be positive and at most tuning.max_submit_pending_time_ms"
            ));
        }
        Ok(())
    }
}

/// Loads and validates the settings from the config locations.
pub fn load_settings() -> Result<SubmitterSettings> {
    let mut builder = Config::builder();

    let config_dir = PathBuf::from("./config");
    if config_dir.is_dir() {
        let mut entries = config_dir
            .read_dir()
            .context("Failed to open config directory")?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()
            .context("Failed to read config directory")?;
        entries.sort();
        for path in entries {
            if path.is_file() && path.extension() == Some("json".as_ref()) {
                builder = builder.add_source(File::from(path));
            }
        }
    }

    // Load a set of additional user specified config files
    let config_file_paths: Vec<String> = env::var("CONFIG_FILES")
        .map(|s| s.split(',').map(|s| s.trim().to_owned()).collect())
        .unwrap_or_default();
    for path in config_file_paths.iter().filter(|p| !p.is_empty()) {
        let p = PathBuf::from(path);
        if p.is_file() {
            if p.extension() == Some("json".as_ref()) {
                builder = builder.add_source(File::from(p));
            } else {
                return Err(eyre!(
                    "Provided config path via CONFIG_FILES is of an unsupported type ({p:?})"
                ));
            }
        } else if !p.exists() {
            return Err(eyre!(
                "Provided config path via CONFIG_FILES does not exist ({p:?})"
            ));
        } else {
            return Err(eyre!(
                "Provided config path via CONFIG_FILES is not a file ({p:?})"
            ));
        }
    }

    let config = builder
        .add_source(
            Environment::with_prefix("SUBMITTER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("rpc_urls")
                .with_list_parse_key("executor_keys"),
        )
        .build()
        .context("Failed to load config sources")?;

    let settings: SubmitterSettings = config
        .try_deserialize()
        .context("Failed to deserialize settings")?;
    settings.validate()?;
    Ok(settings)
}
