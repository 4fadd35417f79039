//! Configuration management for the Helios runtime
//!
//! Sources, later ones winning:
//! 1. `<config-dir>/helios.yml`
//! 2. `<config-dir>/helios-<profile>.yml` when a profile is selected
//! 3. `HELIOS_`-prefixed environment variables, `.` separating nested keys
//!    (`HELIOS_COORDINATION.SESSION_TIMEOUT_MS=5000`)
//! 4. command line flags

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use config::{Config, ConfigError, Environment, File};
use helios_coordination::{AgentId, MasterId, RetryPolicy, SessionConfig, paths};
use helios_model::AgentCapabilities;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::startup::{LogRotation, LoggingConfig};

pub const DEFAULT_CONFIG_DIR: &str = "conf";
const DEFAULT_SESSION_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Role of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Master,
    Agent,
    /// Master and agent sharing one embedded store
    Standalone,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => f.write_str("master"),
            Self::Agent => f.write_str("agent"),
            Self::Standalone => f.write_str("standalone"),
        }
    }
}

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "helios", version, about = "Helios master and agent runtime")]
pub struct Cli {
    #[arg(short = 'm', long = "mode", value_enum)]
    pub mode: Option<Mode>,
    /// Loads `helios-<profile>.yml` on top of `helios.yml`
    #[arg(short = 'p', long = "profile", env = "HELIOS_PROFILE")]
    pub profile: Option<String>,
    /// Node name used for registration and election
    #[arg(short = 'n', long = "name")]
    pub name: Option<String>,
    #[arg(short = 'c', long = "config-dir", default_value = DEFAULT_CONFIG_DIR)]
    pub config_dir: PathBuf,
}

/// Application configuration loaded from config files and environment
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
    profile: Option<String>,
}

impl Configuration {
    /// Load using the process command line.
    pub fn new() -> anyhow::Result<Self> {
        Self::load(&Cli::parse())
    }

    pub fn load(args: &Cli) -> anyhow::Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from(args.config_dir.join("helios.yml")).required(false));

        if let Some(profile) = &args.profile {
            let file = args.config_dir.join(format!("helios-{profile}.yml"));
            builder = builder.add_source(File::from(file).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("HELIOS")
                .prefix_separator("_")
                .separator(".")
                .try_parsing(true),
        );

        if let Some(mode) = args.mode {
            builder = builder.set_override("mode", mode.to_string())?;
        }
        if let Some(name) = &args.name {
            builder = builder.set_override("name", name.as_str())?;
        }

        let config = builder.build().with_context(|| {
            format!(
                "Failed to build configuration from {}",
                args.config_dir.display()
            )
        })?;

        Ok(Configuration {
            config,
            profile: args.profile.clone(),
        })
    }

    /// Read an optional key; absent means `None`, malformed is an error.
    fn optional<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.config.get::<T>(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigError::NotFound(_)) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Invalid value for `{key}`")),
        }
    }

    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    // ========================================================================
    // Node identity
    // ========================================================================

    pub fn mode(&self) -> anyhow::Result<Mode> {
        Ok(self.optional("mode")?.unwrap_or(Mode::Standalone))
    }

    /// Configured node name, else the host name.
    pub fn node_name(&self) -> String {
        self.config
            .get_string("name")
            .ok()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(local_hostname)
    }

    pub fn master_id(&self) -> anyhow::Result<MasterId> {
        let name = self.node_name();
        MasterId::new(name.as_str()).with_context(|| format!("`{name}` is not a valid master id"))
    }

    pub fn agent_id(&self) -> anyhow::Result<AgentId> {
        let name = self.node_name();
        AgentId::new(name.as_str()).with_context(|| format!("`{name}` is not a valid agent id"))
    }

    // ========================================================================
    // Coordination
    // ========================================================================

    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let session_timeout = self
            .optional("coordination.session_timeout_ms")?
            .unwrap_or(DEFAULT_SESSION_TIMEOUT_MS);
        let connect_timeout = self
            .optional("coordination.connect_timeout_ms")?
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
        let retry: RetryPolicy = self.optional("coordination.retry")?.unwrap_or_default();

        Ok(SessionConfig {
            session_timeout: Duration::from_millis(session_timeout),
            connect_timeout: Duration::from_millis(connect_timeout),
            retry,
        })
    }

    pub fn election_path(&self) -> anyhow::Result<String> {
        let path = self
            .optional::<String>("election.path")?
            .unwrap_or_else(|| paths::ELECTION.to_string());
        paths::validate_path(&path, helios_coordination::CreateMode::Persistent)
            .with_context(|| format!("Invalid election path `{path}`"))?;
        Ok(path)
    }

    pub fn shutdown_timeout(&self) -> anyhow::Result<Duration> {
        Ok(Duration::from_millis(
            self.optional("shutdown_timeout_ms")?
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        ))
    }

    // ========================================================================
    // Agent
    // ========================================================================

    pub fn agent_capabilities(&self) -> anyhow::Result<AgentCapabilities> {
        Ok(AgentCapabilities {
            labels: self
                .optional::<BTreeMap<String, String>>("agent.labels")?
                .unwrap_or_default(),
            cpus: self.optional("agent.cpus")?,
            memory_mb: self.optional("agent.memory_mb")?,
        })
    }

    // ========================================================================
    // Logging
    // ========================================================================

    /// Logging settings from the `logging` table; `HELIOS_LOG_*` variables
    /// override them.
    pub fn logging_config(&self) -> anyhow::Result<LoggingConfig> {
        let level: String = self
            .optional("logging.level")?
            .unwrap_or_else(|| "info".to_string());
        let mut logging = LoggingConfig::from_config(
            self.optional("logging.dir")?,
            self.optional("logging.console")?.unwrap_or(true),
            self.optional("logging.file")?.unwrap_or(true),
            &level,
        );
        if let Some(file_level) = self.optional::<String>("logging.file_level")? {
            logging.file_level = file_level
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid value for `logging.file_level`: {file_level}"))?;
        }
        if let Some(rotation) = self.optional::<String>("logging.rotation")? {
            logging.rotation = rotation
                .parse::<LogRotation>()
                .map_err(anyhow::Error::msg)?;
        }
        Ok(logging.with_env_overrides())
    }
}

pub(crate) fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "helios".to_string())
}
