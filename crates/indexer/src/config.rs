//! Configuration management for the Cohort indexer.
//!
//! This module handles loading configuration from:
//! - TOML files
//! - Environment variables referenced as `${VAR_NAME}`
//! - Default values (fallbacks)

use anyhow::{anyhow, bail, Context, Result};
use cohort_core::{
    Protocol, DEFAULT_LEASE_TTL_SECS, DEFAULT_MAX_ATTEMPTS, DEFAULT_REQUESTS_PER_SECOND,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Main configuration for the indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Sync configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Protocols to crawl
    #[serde(default)]
    pub protocols: Vec<ProtocolConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://cohort.db")
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Sync configuration, shared by every protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between ticks of one protocol.
    ///
    /// **Must be > 0** - Zero will cause a panic in tokio::time::interval.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Sub-batch calls allowed per second within one pass
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    /// Attempts per upstream call, first try included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Pause between attempts in milliseconds
    #[serde(default)]
    pub retry_delay_ms: u64,

    /// Seconds a sync lease stays valid without a heartbeat
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// HTTP timeout for subgraph requests
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl SyncConfig {
    /// Interval between ticks.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Pause between attempts.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Subgraph request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            requests_per_second: default_requests_per_second(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: 0,
            lease_ttl_secs: default_lease_ttl_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// One crawled protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Protocol wire name (e.g. "uniswap-v3")
    pub name: Protocol,

    /// Subgraph GraphQL endpoint
    pub endpoint: String,

    /// Register the cursor at this block on startup if it is missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_block: Option<u64>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_requests_per_second() -> u32 {
    DEFAULT_REQUESTS_PER_SECOND
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_lease_ttl_secs() -> u64 {
    DEFAULT_LEASE_TTL_SECS
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Lexical context of the TOML scanner used for `${VAR}` expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lexeme {
    Bare,
    Comment,
    Basic,
    Literal,
    MultiBasic,
    MultiLiteral,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables can be referenced using `${VAR_NAME}` syntax.
    /// For example: `endpoint = "${UNISWAP_SUBGRAPH_URL}"`
    ///
    /// # Example
    /// ```no_run
    /// # use cohort_indexer::config::Config;
    /// let config = Config::from_file("indexer.toml")?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let expanded = Self::expand_env_vars(&contents)?;

        let config: Config = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml).context("Failed to parse TOML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            bail!("Database max_connections must be > 0");
        }
        if self.database.min_connections > self.database.max_connections {
            bail!(
                "Database min_connections ({}) cannot exceed max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.sync.poll_interval_secs == 0 {
            bail!("Sync poll_interval_secs must be > 0 (tokio interval cannot be zero)");
        }
        if self.sync.requests_per_second == 0 {
            bail!("Sync requests_per_second must be > 0");
        }
        if self.sync.max_attempts == 0 {
            bail!("Sync max_attempts must be > 0");
        }
        if self.sync.lease_ttl_secs == 0 {
            bail!("Sync lease_ttl_secs must be > 0");
        }
        if self.sync.request_timeout_secs == 0 {
            bail!("Sync request_timeout_secs must be > 0");
        }

        let mut seen = HashSet::new();
        for protocol in &self.protocols {
            if !seen.insert(protocol.name) {
                bail!("Protocol '{}' is configured more than once", protocol.name);
            }

            let endpoint = protocol.endpoint.trim();
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                bail!(
                    "Protocol '{}' endpoint must start with http:// or https:// (got '{}')",
                    protocol.name,
                    protocol.endpoint
                );
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "Logging level must be one of: {} (got '{}')",
                valid_levels.join(", "),
                self.logging.level
            );
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            bail!(
                "Logging format must be one of: {} (got '{}')",
                valid_formats.join(", "),
                self.logging.format
            );
        }

        Ok(())
    }

    /// Configuration for one protocol, if present.
    pub fn protocol(&self, protocol: Protocol) -> Option<&ProtocolConfig> {
        self.protocols.iter().find(|p| p.name == protocol)
    }

    /// Expand environment variables in the format `${VAR_NAME}`.
    ///
    /// Placeholders inside TOML comments are copied verbatim; placeholders
    /// anywhere else, quoted or not, are replaced. A `#` only opens a comment
    /// outside every string form.
    fn expand_env_vars(input: &str) -> Result<String> {
        let mut out = String::with_capacity(input.len());
        let mut state = Lexeme::Bare;
        let mut i = 0;

        while i < input.len() {
            let rest = &input[i..];

            if state != Lexeme::Comment && rest.starts_with("${") {
                let close = rest.find('}').ok_or_else(|| {
                    anyhow!("Unclosed environment variable placeholder at byte {}", i)
                })?;
                let name = &rest[2..close];
                if name.is_empty() {
                    bail!("Empty environment variable name at byte {}", i);
                }

                let value = std::env::var(name).map_err(|_| {
                    anyhow!(
                        "Environment variable '{}' is not set (referenced at byte {})",
                        name,
                        i
                    )
                })?;
                out.push_str(&value);
                i += close + 1;
                continue;
            }

            let Some(ch) = rest.chars().next() else {
                break;
            };
            // A backslash and the character it escapes move together.
            let escaped_len = if ch == '\\' {
                1 + rest[1..].chars().next().map_or(0, char::len_utf8)
            } else {
                ch.len_utf8()
            };

            let (len, next) = match state {
                Lexeme::Bare if rest.starts_with("\"\"\"") => (3, Lexeme::MultiBasic),
                Lexeme::Bare if rest.starts_with("'''") => (3, Lexeme::MultiLiteral),
                Lexeme::Bare if ch == '"' => (1, Lexeme::Basic),
                Lexeme::Bare if ch == '\'' => (1, Lexeme::Literal),
                Lexeme::Bare if ch == '#' => (1, Lexeme::Comment),
                Lexeme::Comment if ch == '\n' => (1, Lexeme::Bare),
                Lexeme::Basic if ch == '\\' => (escaped_len, Lexeme::Basic),
                Lexeme::Basic if ch == '"' || ch == '\n' => (1, Lexeme::Bare),
                Lexeme::Literal if ch == '\'' || ch == '\n' => (1, Lexeme::Bare),
                Lexeme::MultiBasic if ch == '\\' => (escaped_len, Lexeme::MultiBasic),
                Lexeme::MultiBasic if rest.starts_with("\"\"\"") => (3, Lexeme::Bare),
                Lexeme::MultiLiteral if rest.starts_with("'''") => (3, Lexeme::Bare),
                _ => (ch.len_utf8(), state),
            };

            out.push_str(&rest[..len]);
            i += len;
            state = next;
        }

        Ok(out)
    }
}
