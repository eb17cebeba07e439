use anyhow::Result;
use tracing::{info, warn};

use crate::session::{Orchestrator, ShutdownMode};

/// Graceful shutdown coordinator for the conductor
pub struct ShutdownCoordinator {
    orchestrator: Orchestrator,
    mode: ShutdownMode,
}

impl ShutdownCoordinator {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            mode: ShutdownMode::Detach,
        }
    }

    pub fn with_mode(mut self, mode: ShutdownMode) -> Self {
        self.mode = mode;
        self
    }

    /// Resolves on Ctrl-C
    pub async fn wait_for_signal() -> Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");
        Ok(())
    }

    pub async fn shutdown_now(&self) -> Result<()> {
        info!(mode = ?self.mode, "Initiating graceful shutdown");
        if let Err(e) = self.orchestrator.shutdown(self.mode).await {
            warn!(error = %e, "Orchestrator was already stopped");
        }
        info!("Graceful shutdown completed");
        Ok(())
    }
}
