use anyhow::Result;
use clap::Parser;
use tracing::info;

use agent_conductor::cli::commands::{
    load_config, recover::RecoverCommand, run::RunCommand, status::StatusCommand,
    validate::ValidateCommand,
};
use agent_conductor::cli::{Cli, Commands};
use agent_conductor::telemetry::{generate_correlation_id, init_telemetry, shutdown_telemetry};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    if let Err(e) = init_telemetry(&config.logging) {
        eprintln!("Warning: Failed to initialize telemetry: {e}");
    }
    info!(correlation_id = %generate_correlation_id(), "Conductor starting");

    let result = match cli.command {
        Commands::Run { plan, dry_run } => tokio::runtime::Runtime::new()?.block_on(async {
            RunCommand::new(plan)
                .with_dry_run(dry_run)
                .execute(&config)
                .await
        }),
        Commands::Validate { plan } => tokio::runtime::Runtime::new()?
            .block_on(async { ValidateCommand::new(plan).execute(&config).await }),
        Commands::Recover { dry_run } => tokio::runtime::Runtime::new()?.block_on(async {
            RecoverCommand::new()
                .with_dry_run(dry_run)
                .execute(&config)
                .await
        }),
        Commands::Status { session_id } => tokio::runtime::Runtime::new()?
            .block_on(async { StatusCommand::new(session_id).execute(&config).await }),
    };

    shutdown_telemetry();
    result
}
