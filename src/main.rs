//! bootprov - Main entry point
//!
//! Exit codes: 0 when every step succeeded, 1 when a provisioning step
//! failed (the step is named in the log), 2 for unusable configuration.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bootprov::cli::{Cli, Commands};
use bootprov::{
    DryRunHost, Host, ProvisionConfig, Provisioner, ServiceUnitSpec, SystemHost,
    render_user_data,
};

/// Initialize the logger; boot logs capture stderr
fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_logger();

    let cli = Cli::parse_args();
    match dispatch(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn dispatch(cli: &Cli) -> Result<ExitCode> {
    match &cli.command {
        Commands::Run { config, report } => {
            let config = load_valid_config(config)?;
            info!(
                service = %config.service.name,
                package_manager = %config.package_manager,
                start_policy = %config.start_policy,
                dry_run = cli.dry_run,
                "bootprov starting provisioning run"
            );

            let provisioner = Provisioner::from_config(&config);
            let dry_run_host;
            let system_host;
            let host: &dyn Host = if cli.dry_run {
                dry_run_host = DryRunHost::new();
                &dry_run_host
            } else {
                system_host = SystemHost::new();
                &system_host
            };

            let run_report = provisioner.run(host);
            let code = run_report.save_and_exit_code(report.as_deref());

            if let Some(failure) = run_report.failure() {
                eprintln!(
                    "✗ Provisioning failed at step {} ({})",
                    failure.step.index(),
                    failure.step
                );
            } else {
                println!("✓ Provisioning complete: {}", config.service.file_name());
                if !run_report.service_started_now {
                    println!("  {} is enabled and starts on the next boot", config.service.file_name());
                }
            }
            Ok(ExitCode::from(code as u8))
        }
        Commands::Validate { config } => {
            let config = load_valid_config(config)?;
            info!("Configuration validation successful");
            println!("✓ Configuration is valid: {} steps", Provisioner::from_config(&config).steps().len());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Plan { config } => {
            let config = load_valid_config(config)?;
            let provisioner = Provisioner::from_config(&config);
            for step in provisioner.steps() {
                let id = step.id();
                println!("{}. {} - {}", id.index(), id, id.description());
                for precondition in step.preconditions() {
                    println!("     requires: {}", precondition);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::RenderUnit { config } => {
            let config = load_valid_config(config)?;
            print!("{}", config.service.render());
            Ok(ExitCode::SUCCESS)
        }
        Commands::RenderUserData { config } => {
            let config = load_valid_config(config)?;
            print!("{}", render_user_data(&config));
            Ok(ExitCode::SUCCESS)
        }
        Commands::InitConfig { path, force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            ProvisionConfig::default().save_to_file(path)?;
            println!("✓ Default configuration written to {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::ParseUnit { path } => {
            let spec = ServiceUnitSpec::read_from(path)
                .with_context(|| format!("Failed to parse unit file {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&spec)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_valid_config(path: &Path) -> Result<ProvisionConfig> {
    info!("Loading configuration file: {:?}", path);
    let config = ProvisionConfig::load_from_file(path)?;
    config
        .validate()
        .with_context(|| format!("Configuration {:?} is invalid", path))?;
    Ok(config)
}
