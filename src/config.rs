use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agents::resource_limiter::ResourceLimits;

/// Main configuration structure for the conductor
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConductorConfig {
    /// Admission control limits
    pub limits: LimitsConfig,
    /// Per-role overrides, keyed by role name
    pub roles: HashMap<String, RoleProfile>,
    /// Health supervision and shutdown timing
    pub supervision: SupervisionConfig,
    /// Checkpoint storage
    pub checkpoints: CheckpointConfig,
    /// Worker process launching
    pub launcher: LauncherConfig,
    /// Event stream buffering
    pub events: EventsConfig,
    /// Log output
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum agents running at once across all sessions
    pub max_active_agents: usize,
    /// Cap for roles without an explicit `max_instances`
    pub default_role_cap: usize,
    /// Total memory that may be reserved by running agents
    pub memory_budget_mb: u64,
    /// Reservation for agents that declare no memory requirement
    pub default_agent_memory_mb: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_active_agents: 20,
            default_role_cap: 5,
            memory_budget_mb: 16 * 1024,
            default_agent_memory_mb: 512,
        }
    }
}

/// Resource profile for a role, supplied by whatever decides how a role behaves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RoleProfile {
    pub max_instances: Option<usize>,
    pub memory_mb: Option<u64>,
    /// Runtime limit before the agent is interrupted
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisionConfig {
    pub health_interval_ms: u64,
    /// Random delay added to each supervisor's first poll
    pub poll_jitter_ms: u64,
    /// Grace period between a polite and a forced termination
    pub shutdown_timeout_ms: u64,
    pub max_resume_attempts: u32,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: 5_000,
            poll_jitter_ms: 250,
            shutdown_timeout_ms: 10_000,
            max_resume_attempts: 1,
        }
    }
}

impl SupervisionConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub directory: PathBuf,
    /// Checkpoints kept per session after each save
    pub keep_per_session: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(".conductor/checkpoints"),
            keep_per_session: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Worker binary started for every agent
    pub program: String,
    pub args: Vec<String>,
    /// Agent workspaces live under `<workspace_root>/<session>/<agent>`
    pub workspace_root: PathBuf,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec!["--print".to_string()],
            workspace_root: PathBuf::from(".conductor/workspaces"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events retained per session for `event_history`
    pub history_limit: usize,
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            history_limit: 1_000,
            channel_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    /// `json` or `pretty`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl ConductorConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (conductor.toml, .conductor-rc)
    /// 3. Environment variables (prefixed with CONDUCTOR_, nested keys split on `__`)
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder();

        if Path::new("conductor.toml").exists() {
            builder = builder.add_source(File::with_name("conductor"));
        }

        if Path::new(".conductor-rc").exists() {
            builder = builder.add_source(
                File::with_name(".conductor-rc").format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("CONDUCTOR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load configuration from an explicit file, still honouring environment overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("CONDUCTOR")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            max_active_agents: self.limits.max_active_agents,
            default_role_cap: self.limits.default_role_cap,
            role_caps: self
                .roles
                .iter()
                .filter_map(|(role, profile)| profile.max_instances.map(|cap| (role.clone(), cap)))
                .collect(),
            memory_budget_mb: self.limits.memory_budget_mb,
        }
    }
}
