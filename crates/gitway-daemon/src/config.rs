//! Daemon configuration.
//!
//! Values come from an optional YAML or TOML file, then `GITWAY_`-prefixed
//! environment variables (`GITWAY_SESSION__ALLOW_DELETES=false` for nested
//! keys), then command-line flags.

use crate::error::Result;
use crate::logging::LogFormat;
use gitway_git::SessionConfig;
use gitway_storage::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Configuration for the daemon.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// TCP listen address.
    pub listen: SocketAddr,
    /// Log level.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Hash function of repositories created at start-up.
    pub hash_algorithm: HashAlgorithm,
    /// Repository paths created empty at start-up.
    pub repositories: Vec<String>,
    /// Protocol knobs handed to every session.
    pub session: SessionConfig,
    /// Connections served at once; further clients wait.
    pub max_connections: usize,
    /// Wall-clock limit of one session. Zero disables it.
    pub session_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 9418)),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            hash_algorithm: HashAlgorithm::Sha1,
            repositories: Vec::new(),
            session: SessionConfig {
                advertise_service_prefix: false,
                ..SessionConfig::default()
            },
            max_connections: 64,
            session_timeout_secs: 600,
        }
    }
}

/// Command-line values that take precedence over file and environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// `--listen`
    pub listen: Option<SocketAddr>,
    /// `--log-level`
    pub log_level: Option<String>,
    /// `--log-format`
    pub log_format: Option<LogFormat>,
    /// `--repo`, repeatable.
    pub repositories: Vec<String>,
}

impl DaemonConfig {
    /// Loads the layered configuration.
    pub fn load(file: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GITWAY")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("repositories")
                .try_parsing(true),
        );

        builder = builder
            .set_override_option("listen", overrides.listen.map(|a| a.to_string()))?
            .set_override_option("log_level", overrides.log_level)?
            .set_override_option(
                "log_format",
                overrides.log_format.map(|f| match f {
                    LogFormat::Json => "json",
                    LogFormat::Pretty => "pretty",
                }),
            )?;
        if !overrides.repositories.is_empty() {
            builder = builder.set_override("repositories", overrides.repositories)?;
        }

        let mut config: DaemonConfig = builder.build()?.try_deserialize()?;
        // git:// clients never expect the smart-HTTP service line.
        config.session.advertise_service_prefix = false;
        Ok(config)
    }

    /// Session time limit, `None` when disabled.
    pub fn session_timeout(&self) -> Option<Duration> {
        (self.session_timeout_secs > 0).then(|| Duration::from_secs(self.session_timeout_secs))
    }
}
