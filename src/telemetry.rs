use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::LoggingConfig;

/// Install the global subscriber on stderr. `RUST_LOG` wins over the configured level.
pub fn init_telemetry(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))?;

    match logging.format.as_str() {
        "pretty" => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .try_init()?,
        _ => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .with(filter)
            .try_init()?,
    }

    tracing::info!(format = %logging.format, "Conductor telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span carried by every orchestrator request
pub fn create_orchestration_span(
    operation: &str,
    session_id: Option<&str>,
    agent_id: Option<&str>,
) -> tracing::Span {
    tracing::info_span!(
        "orchestration",
        operation = operation,
        session.id = session_id,
        agent.id = agent_id,
    )
}

pub fn shutdown_telemetry() {
    tracing::info!("Conductor telemetry shutdown complete");
}
