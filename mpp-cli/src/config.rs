use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, File};
use log::LevelFilter;
use mpp_lib::invoice::{OverpaymentPolicy, RegistryConfig};
use mpp_lib::payment::{PaymentConfig, DEFAULT_RESOLUTION_GRACE};
use serde::Deserialize;

use crate::cli::{
    Cli, DEFAULT_CONFIGURATION_FILE, DEFAULT_DATA_DIR, DEFAULT_LOG_LEVEL, DEFAULT_PRINT_BATCH_SIZE,
    DEFAULT_SCENARIO_FILE,
};

/// Overwrites the fields on a MppConfig if corresponding arguments are supplied via the command line
macro_rules! cli_overwrite {
    ($config:expr, $cli:expr, $($field:ident),*) => {
        match (&mut $config, $cli) {
            (config_struct, cli_struct) => {
                $(
                    if let Some(value) = cli_struct.$field {
                        log::info!(
                            "MppConfig::{} {:?} overwritten by CLI argument {:?}",
                            stringify!($field),
                            config_struct.$field,
                            value
                        );
                        config_struct.$field = value;
                    }
                )*
            }
        }

    };
}

#[derive(Debug, Deserialize)]
pub struct MppConfig {
    /// Path to a directory where scenario files live and attempt records are saved
    pub data_dir: PathBuf,
    /// Path to the scenario file
    pub scenario_file: PathBuf,
    /// Seconds that the recipient holds an incomplete set of htlcs
    pub hold_timeout_secs: u64,
    /// Seconds that a shard may be in flight
    pub shard_timeout_secs: u64,
    #[serde(deserialize_with = "serde_config::deserialize_overpayment")]
    pub overpayment: OverpaymentPolicy,
    /// Level of verbosity of the messages displayed by the runner.
    /// Possible values: [off, error, warn, info, debug, trace]
    #[serde(deserialize_with = "serde_config::deserialize_log_level")]
    pub log_level: LevelFilter,
    /// Number of attempt records to batch together before writing to csv file [min: 1]
    pub print_batch_size: u32,
    /// Do not create an output file containing the attempt records
    pub no_results: bool,
    /// Average per-hop latency in milliseconds, zero for none
    pub latency_ms: f32,
}

/// Custom deserializers for MppConfig fields
mod serde_config {
    use std::str::FromStr;

    use log::LevelFilter;
    use mpp_lib::invoice::OverpaymentPolicy;
    use serde::Deserialize;

    use crate::cli::parse_overpayment;

    /// Custom deserialization function for `LevelFilter`. Required because `LevelFilter` does
    /// not implement deserialize
    pub fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let level_filter_str = String::deserialize(deserializer)?;
        let level_filter = LevelFilter::from_str(&level_filter_str).map_err(|e| {
            serde::de::Error::custom(format!("Failed to deserialize LevelFilter from &str: {e}"))
        })?;

        Ok(level_filter)
    }

    /// Ini values are plain strings, so the policy is parsed the same way as on the command line.
    pub fn deserialize_overpayment<'de, D>(deserializer: D) -> Result<OverpaymentPolicy, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let policy_str = String::deserialize(deserializer)?;
        parse_overpayment(&policy_str).map_err(serde::de::Error::custom)
    }
}

impl MppConfig {
    /// Loads the configuration from a path and overwrites loaded values with CLI arguments. Settings missing from
    /// the file take their defaults, and a missing default configuration file is skipped.
    pub fn load(path: &Path, cli: Cli) -> anyhow::Result<Self> {
        // 1. Load config from specified path
        let path_str = if let Some(path_str) = path.to_str() {
            path_str
        } else {
            anyhow::bail!("Failed to convert path {path:?} to &str.")
        };

        let required = path != Path::new(DEFAULT_CONFIGURATION_FILE);
        if !required && !path.exists() {
            log::info!("Default configuration file: {path:?} (not found, skipping).");
        }

        let config = Config::builder()
            .set_default("data_dir", DEFAULT_DATA_DIR)?
            .set_default("scenario_file", DEFAULT_SCENARIO_FILE)?
            .set_default("hold_timeout_secs", 120_i64)?
            .set_default("shard_timeout_secs", 180_i64)?
            .set_default("overpayment", "reject")?
            .set_default("log_level", DEFAULT_LOG_LEVEL)?
            .set_default("print_batch_size", i64::from(DEFAULT_PRINT_BATCH_SIZE))?
            .set_default("no_results", false)?
            .set_default("latency_ms", 0.0_f64)?
            .add_source(File::with_name(path_str).required(required))
            .build()?;
        let mut mpp_conf: MppConfig = config.try_deserialize()?;

        // 2. Overwrite config values with CLI arguments (if passed)
        cli_overwrite!(
            mpp_conf,
            cli,
            data_dir,
            scenario_file,
            hold_timeout_secs,
            shard_timeout_secs,
            overpayment,
            log_level,
            print_batch_size,
            no_results,
            latency_ms
        );

        mpp_conf.validate()?;

        Ok(mpp_conf)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.hold_timeout_secs == 0 {
            anyhow::bail!("hold_timeout_secs must be at least 1.");
        }
        if self.shard_timeout_secs == 0 {
            anyhow::bail!("shard_timeout_secs must be at least 1.");
        }
        if self.print_batch_size == 0 {
            anyhow::bail!("print_batch_size must be at least 1.");
        }
        if self.latency_ms < 0.0 {
            anyhow::bail!("latency_ms must not be negative.");
        }

        Ok(())
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            hold_timeout: Duration::from_secs(self.hold_timeout_secs),
            overpayment: self.overpayment,
            ..RegistryConfig::default()
        }
    }

    pub fn payment_config(&self) -> PaymentConfig {
        PaymentConfig {
            shard_timeout: Duration::from_secs(self.shard_timeout_secs),
            resolution_grace: DEFAULT_RESOLUTION_GRACE,
        }
    }
}
