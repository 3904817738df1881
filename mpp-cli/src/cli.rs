use std::path::PathBuf;

use clap::{builder::TypedValueParser, Parser};
use log::LevelFilter;
use mpp_lib::invoice::OverpaymentPolicy;

/// The default directory where scenario files are read from and where attempt records are written to.
pub const DEFAULT_DATA_DIR: &str = ".";

/// The default scenario file.
pub const DEFAULT_SCENARIO_FILE: &str = "scenario.json";

/// Default configuration file
pub const DEFAULT_CONFIGURATION_FILE: &str = "conf.ini";

/// Default batch size to flush attempt records to disk
pub const DEFAULT_PRINT_BATCH_SIZE: u32 = 500;

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Parses a latency in milliseconds, which may be zero (no latency) but never negative.
fn parse_latency_ms(x: String) -> Result<f32, String> {
    match x.parse::<f32>() {
        Ok(x) => {
            if x >= 0.0 {
                Ok(x)
            } else {
                Err(format!("latency_ms must not be negative. {x} received."))
            }
        },
        Err(e) => Err(e.to_string()),
    }
}

/// Parses an overpayment policy from its lowercase name.
pub fn parse_overpayment(x: &str) -> Result<OverpaymentPolicy, String> {
    match x.to_lowercase().as_str() {
        "reject" => Ok(OverpaymentPolicy::Reject),
        "accept" => Ok(OverpaymentPolicy::Accept),
        _ => Err(format!(
            "overpayment must be one of [reject, accept]. {x} received."
        )),
    }
}

/// Command line arguments. Every setting is optional so that values that are not provided fall back to the
/// configuration file.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Cli {
    /// Path to a directory containing scenario files, and where attempt records will be stored
    #[clap(long, short)]
    pub data_dir: Option<PathBuf>,
    /// Path to the scenario file describing the network and the payment to send
    /// This can either be an absolute path, or relative path with respect to data_dir
    #[clap(long, short, verbatim_doc_comment)]
    pub scenario_file: Option<PathBuf>,
    /// Sets a custom configuration (INI) file
    #[clap(long, short = 'C', value_name = "CONFIG_FILE", default_value = DEFAULT_CONFIGURATION_FILE)]
    pub config: PathBuf,
    /// Seconds that the recipient holds an incomplete set of htlcs before failing them back
    #[clap(
        long,
        value_parser = clap::builder::RangedU64ValueParser::<u64>::new().range(1..)
    )]
    pub hold_timeout_secs: Option<u64>,
    /// Seconds that a shard may be in flight before the sender gives up on it
    #[clap(
        long,
        value_parser = clap::builder::RangedU64ValueParser::<u64>::new().range(1..)
    )]
    pub shard_timeout_secs: Option<u64>,
    /// Whether the recipient accepts a payment total above the invoice amount.
    /// Possible values: [reject, accept]
    #[clap(long, verbatim_doc_comment, value_parser = parse_overpayment)]
    pub overpayment: Option<OverpaymentPolicy>,
    /// Level of verbosity of the messages displayed by the runner.
    /// Possible values: [off, error, warn, info, debug, trace]
    #[clap(long, short, verbatim_doc_comment)]
    pub log_level: Option<LevelFilter>,
    /// Number of attempt records to batch together before writing to csv file [min: 1]
    #[clap(
        long,
        short,
        value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..u32::MAX as u64)
    )]
    pub print_batch_size: Option<u32>,
    /// Do not create an output file containing the attempt records
    #[clap(long)]
    pub no_results: Option<bool>,
    /// Average per-hop forwarding latency in milliseconds, zero to forward instantly
    #[clap(
        long,
        value_parser = clap::builder::StringValueParser::new().try_map(parse_latency_ms)
    )]
    pub latency_ms: Option<f32>,
}
