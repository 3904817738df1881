use clap::Parser;
use log::LevelFilter;
use mpp_cli::cli::Cli;
use mpp_cli::config::MppConfig;
use mpp_cli::parsing::{create_scenario, parse_scenario, read_scenario_path};
use simple_logger::SimpleLogger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone();
    let cfg = MppConfig::load(&config_path, cli)?;

    SimpleLogger::new()
        .with_level(LevelFilter::Warn)
        .with_module_level("mpp_lib", cfg.log_level)
        .with_module_level("mpp_cli", cfg.log_level)
        .init()?;

    let scenario_path = read_scenario_path(&cfg.data_dir, &cfg.scenario_file)?;
    let scenario = parse_scenario(&scenario_path)?;
    log::info!("Running scenario {}.", scenario_path.display());

    let (shutdown_trigger, shutdown_listener) = triggered::trigger();
    let run = create_scenario(&cfg, scenario, shutdown_trigger.clone(), shutdown_listener).await?;

    let ctrlc_trigger = shutdown_trigger.clone();
    ctrlc::set_handler(move || {
        log::info!("Shutting down payment run.");
        ctrlc_trigger.trigger();
    })?;

    let report = run.run().await;

    shutdown_trigger.trigger();
    run.wait_for_shutdown().await;

    let report = report?;
    if report.result.is_success() {
        log::info!("Payment succeeded with {} htlcs.", report.result.succeeded);
    } else {
        log::warn!("Payment failed: {:?}.", report.result.payment_outcome);
    }

    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
