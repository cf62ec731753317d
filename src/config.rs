use crate::error::{ApiError, ErrorCode, GatewayResult};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "cmdproxy.toml";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum TelnetLineEnding {
    #[default]
    Lf,
    Cr,
    Crlf,
}

impl TelnetLineEnding {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            TelnetLineEnding::Lf => b"\n",
            TelnetLineEnding::Cr => b"\r",
            TelnetLineEnding::Crlf => b"\r\n",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub local: LocalConfig,
    pub telnet: TelnetConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:25505".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on waiting for one command's output, and on each backend read/write.
    pub command_timeout_ms: u64,
    /// Quiet period between commands after which a session closes itself.
    pub idle_timeout_ms: u64,
    /// How often the pool sweeps out sessions that closed on their own. Zero disables it.
    pub reap_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 5_000,
            idle_timeout_ms: 10_000,
            reap_interval_ms: 30_000,
        }
    }
}

impl SessionConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub echo_delay_ms: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            echo_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelnetConfig {
    pub connect_timeout_ms: u64,
    pub line_ending: TelnetLineEnding,
}

impl Default for TelnetConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            line_ending: TelnetLineEnding::Lf,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(author, version = crate::version::VERSION, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run the HTTP gateway.
    Serve(ServeArgs),
}

#[derive(Debug, Parser, Clone, Default)]
pub struct ServeArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub listen: Option<String>,
    #[arg(long)]
    pub command_timeout_ms: Option<u64>,
    #[arg(long)]
    pub idle_timeout_ms: Option<u64>,
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Config {
    pub fn load(args: &ServeArgs) -> GatewayResult<Self> {
        let mut config = if let Some(path) = &args.config {
            Self::from_file(path)?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
        } else {
            Self::default()
        };

        config.apply_env();
        config.apply_cli(args);
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> GatewayResult<Self> {
        let content = fs::read_to_string(path).map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to read config file")
                .with_details(err.to_string())
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> GatewayResult<Self> {
        let parsed: Self = toml::from_str(content).map_err(|err| {
            ApiError::new(ErrorCode::InvalidArgument, "Failed to parse config file")
                .with_details(err.to_string())
        })?;
        Ok(parsed)
    }

    fn apply_env(&mut self) {
        if let Ok(value) = env::var("CMDPROXY_LISTEN") {
            self.server.listen = value;
        }
        if let Ok(value) = env::var("CMDPROXY_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Some(ms) = env_millis("CMDPROXY_COMMAND_TIMEOUT_MS") {
            self.session.command_timeout_ms = ms;
        }
        if let Some(ms) = env_millis("CMDPROXY_IDLE_TIMEOUT_MS") {
            self.session.idle_timeout_ms = ms;
        }
    }

    fn apply_cli(&mut self, args: &ServeArgs) {
        if let Some(listen) = &args.listen {
            self.server.listen = listen.clone();
        }
        if let Some(ms) = args.command_timeout_ms {
            self.session.command_timeout_ms = ms;
        }
        if let Some(ms) = args.idle_timeout_ms {
            self.session.idle_timeout_ms = ms;
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
    }

    fn validate(&self) -> GatewayResult<()> {
        if self.session.command_timeout_ms == 0 {
            return Err(ApiError::new(
                ErrorCode::InvalidArgument,
                "session.command_timeout_ms must be greater than zero",
            )
            .into());
        }
        if self.session.idle_timeout_ms == 0 {
            return Err(ApiError::new(
                ErrorCode::InvalidArgument,
                "session.idle_timeout_ms must be greater than zero",
            )
            .into());
        }
        Ok(())
    }
}

fn env_millis(name: &str) -> Option<u64> {
    let value = env::var(name).ok()?;
    match value.trim().parse::<u64>() {
        Ok(ms) => Some(ms),
        Err(_) => {
            tracing::warn!(variable = name, value = %value, "Ignoring non-numeric timeout");
            None
        }
    }
}
