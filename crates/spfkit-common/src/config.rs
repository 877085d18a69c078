//! Configuration for spfkit

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fixed explanation template used when a record publishes no `exp=` modifier
pub const DEFAULT_EXPLANATION: &str = "http://www.openspf.org/why.html?sender=%{S}&ip=%{I}";

/// Record evaluated for domains that publish nothing, when best guess is enabled
pub const DEFAULT_BEST_GUESS_RECORD: &str = "v=spf1 a/24 mx/24 ptr ?all";

/// Domain included by the trusted forwarder stage
pub const DEFAULT_TRUSTED_FORWARDER: &str = "spf.trusted-forwarder.org";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// DNS configuration
    #[serde(default)]
    pub dns: DnsConfig,

    /// Policy chain configuration
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Executor configuration
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// DNS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Per-lookup timeout in milliseconds
    #[serde(default = "default_dns_timeout")]
    pub timeout_ms: u64,

    /// Maximum number of MX/PTR answers considered per mechanism
    #[serde(default = "default_record_limit")]
    pub record_limit: usize,

    /// Names used for the `%{r}` macro when no receiving domain is known
    #[serde(default)]
    pub local_domain_names: Vec<String>,

    /// Upstream nameservers (`ip` or `ip:port`); system configuration when empty
    #[serde(default)]
    pub nameservers: Vec<String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_dns_timeout(),
            record_limit: default_record_limit(),
            local_domain_names: Vec::new(),
            nameservers: Vec::new(),
        }
    }
}

fn default_dns_timeout() -> u64 {
    5000
}

fn default_record_limit() -> usize {
    10
}

/// Policy chain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Explanation template used on `fail` when the record has none.
    /// An empty string disables the default explanation stage.
    #[serde(default = "default_explanation")]
    pub default_explanation: String,

    /// Evaluate a best-guess record for domains without SPF
    #[serde(default)]
    pub use_best_guess: bool,

    /// Record used by the best-guess stage
    #[serde(default = "default_best_guess_record")]
    pub best_guess_record: String,

    /// Inject an include of the trusted forwarder domain
    #[serde(default)]
    pub use_trusted_forwarder: bool,

    /// Trusted forwarder domain
    #[serde(default = "default_trusted_forwarder")]
    pub trusted_forwarder: String,

    /// Require SPF and TXT records to agree
    #[serde(default)]
    pub strict_records: bool,

    /// Records that replace DNS for the given hosts (`*.example.com` wildcards allowed)
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,

    /// Records used when a host publishes nothing
    #[serde(default)]
    pub fallbacks: BTreeMap<String, String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_explanation: default_explanation(),
            use_best_guess: false,
            best_guess_record: default_best_guess_record(),
            use_trusted_forwarder: false,
            trusted_forwarder: default_trusted_forwarder(),
            strict_records: false,
            overrides: BTreeMap::new(),
            fallbacks: BTreeMap::new(),
        }
    }
}

fn default_explanation() -> String {
    DEFAULT_EXPLANATION.to_string()
}

fn default_best_guess_record() -> String {
    DEFAULT_BEST_GUESS_RECORD.to_string()
}

fn default_trusted_forwarder() -> String {
    DEFAULT_TRUSTED_FORWARDER.to_string()
}

/// Strategy used to drive sessions through their DNS lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Await each lookup in place
    #[default]
    Blocking,
    /// Resume sessions from lookup completion callbacks
    Callback,
    /// Hand lookups to a bounded worker pool
    Queued,
}

impl std::str::FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blocking" => Ok(ExecutorKind::Blocking),
            "callback" => Ok(ExecutorKind::Callback),
            "queued" => Ok(ExecutorKind::Queued),
            other => Err(format!("unknown executor kind: {}", other)),
        }
    }
}

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Executor strategy
    #[serde(default)]
    pub kind: ExecutorKind,

    /// Worker tasks for the queued executor
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Sessions allowed in flight before producers wait (queued executor)
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::default(),
            workers: default_workers(),
            max_outstanding: default_max_outstanding(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_max_outstanding() -> usize {
    64
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default locations, falling back to defaults
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./spfkit.toml"),
            std::path::PathBuf::from("/etc/spfkit/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Ok(Config::default())
    }

    /// Check values serde cannot express
    pub fn validate(&self) -> crate::Result<()> {
        if self.dns.record_limit == 0 {
            return Err(crate::Error::Validation(
                "dns.record_limit must be at least 1".to_string(),
            ));
        }
        if self.executor.workers == 0 || self.executor.max_outstanding == 0 {
            return Err(crate::Error::Validation(
                "executor.workers and executor.max_outstanding must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
