//! # Configuration Management
//!
//! Centralized configuration for the sync server and client.
//!
//! One TOML file carries four sections: `[server]`, `[index]`, `[client]` and
//! `[logging]`. Every section falls back to its defaults when absent, so a
//! server and a client can share one file or each keep their own.
//!
//! ## Configuration Sources
//! - TOML files via [`AppConfig::from_file`]
//! - [`AppConfig::load_or_init`], which writes the defaults back when the file
//!   does not exist yet
//! - Direct instantiation with defaults
//!
//! ## Index rules
//! Rules are applied in order; a later rule overrides an earlier one for the
//! same content hash. The default rule set catalogs `config`, `.jar` files
//! directly under `mods`, and `client`, then re-registers the user-editable
//! client settings as preserve-if-present.

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, Level};

/// Current supported protocol version (signing shape)
pub const PROTOCOL_VERSION: u8 = 2;

/// Default listen port
pub const DEFAULT_PORT: u16 = 48879;

/// Longest client path accepted on the wire
pub const MAX_PATH_LEN: u64 = 4096;

/// Default cap on the metrics blob a client may upload (1 MiB)
pub const MAX_METRICS_SIZE: u64 = 1024 * 1024;

/// Default cap on a single indexed file (512 MiB)
pub const MAX_FILE_SIZE: u64 = 512 * 1024 * 1024;

/// Name fragment that excludes a file or directory from indexing and hashing
pub const IGNORE_MARKER: &str = "ignored_";

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AppConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Content index rules
    #[serde(default)]
    pub index: IndexConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load the file at `path`, or write the defaults there and return them
    pub fn load_or_init<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::from_file(path);
        }

        let config = Self::default();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ProtocolError::ConfigError(format!("Failed to create config directory: {e}"))
                })?;
            }
        }
        config.save_to_file(path)?;
        info!(path = %path.display(), "Wrote default configuration");
        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.index.validate());
        errors.extend(self.client.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:48879")
    pub address: String,

    /// DNS name written into generated certificates
    pub server_name: String,

    /// PEM certificate chain
    pub cert_path: PathBuf,

    /// PEM private key for TLS
    pub key_path: PathBuf,

    /// Signing key file (base64 secret and public key lines)
    pub signing_key_path: PathBuf,

    /// Machine ledger file
    pub ledger_path: PathBuf,

    /// Absolute per-connection deadline, measured from accept
    #[serde(with = "duration_serde")]
    pub connection_deadline: Duration,

    /// Quiet period before a dirty index is rebuilt
    #[serde(with = "duration_serde")]
    pub rebuild_delay: Duration,

    /// Largest metrics blob accepted from a client
    pub max_metrics_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: format!("0.0.0.0:{DEFAULT_PORT}"),
            server_name: String::from("localhost"),
            cert_path: PathBuf::from("cert.pem"),
            key_path: PathBuf::from("key.pem"),
            signing_key_path: PathBuf::from("ss.key"),
            ledger_path: PathBuf::from("machines.log"),
            connection_deadline: timeout::CONNECTION_DEADLINE,
            rebuild_delay: timeout::REBUILD_DELAY,
            max_metrics_size: MAX_METRICS_SIZE,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:48879')",
                self.address
            ));
        }

        if self.server_name.is_empty() {
            errors.push("Server name cannot be empty".to_string());
        }

        if self.connection_deadline.as_millis() < 100 {
            errors.push("Connection deadline too short (minimum: 100ms)".to_string());
        } else if self.connection_deadline.as_secs() > 3600 {
            errors.push("Connection deadline too long (maximum: 1 hour)".to_string());
        }

        if self.rebuild_delay.as_millis() < 10 {
            errors.push("Rebuild delay too short (minimum: 10ms)".to_string());
        } else if self.rebuild_delay.as_secs() > 600 {
            errors.push("Rebuild delay too long (maximum: 10 minutes)".to_string());
        }

        if self.max_metrics_size == 0 {
            errors.push("Max metrics size must be greater than 0".to_string());
        }

        if self.signing_key_path.as_os_str().is_empty() {
            errors.push("Signing key path cannot be empty".to_string());
        }

        if self.ledger_path.as_os_str().is_empty() {
            errors.push("Ledger path cannot be empty".to_string());
        }

        errors
    }
}

/// One filesystem subtree (or single file) to catalog
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IndexRule {
    /// Source file or directory on the server
    pub path: PathBuf,

    /// Prefix of the client-relative path; `.` or empty maps to the install root
    pub target: String,

    /// Walk subdirectories too
    #[serde(default)]
    pub recursive: bool,

    /// Always overwrite the client copy; otherwise an existing client file is kept
    #[serde(default)]
    pub mandatory: bool,

    /// Only index files with one of these extensions (empty: all files)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
}

impl IndexRule {
    pub fn new(path: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            target: target.into(),
            recursive: false,
            mandatory: false,
            extensions: Vec::new(),
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    pub fn extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    /// True if `path` passes this rule's extension filter
    pub fn accepts_extension(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.extensions
                    .iter()
                    .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }
}

/// Content index configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Ordered rule set
    pub rules: Vec<IndexRule>,

    /// Name fragments excluded from indexing (in addition to the ignore marker)
    pub ignored: Vec<String>,

    /// Files larger than this are skipped with a warning
    pub max_file_size: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                IndexRule::new("config", "config")
                    .recursive(true)
                    .mandatory(true),
                IndexRule::new("mods", "mods")
                    .mandatory(true)
                    .extensions(["jar"]),
                IndexRule::new("client", ".").recursive(true).mandatory(true),
                // user-editable client settings are only delivered once
                IndexRule::new("client/config", "config").recursive(true),
                IndexRule::new("client/options.txt", "options.txt"),
                IndexRule::new("client/optionsof.txt", "optionsof.txt"),
            ],
            ignored: vec![
                String::from("shadowfacts"),
                String::from("FastAsyncWorldEdit"),
            ],
            max_file_size: MAX_FILE_SIZE,
        }
    }
}

impl IndexConfig {
    /// Validate index configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.rules.is_empty() {
            errors.push("At least one index rule is required".to_string());
        }

        for (position, rule) in self.rules.iter().enumerate() {
            if rule.path.as_os_str().is_empty() {
                errors.push(format!("Index rule {position} has an empty source path"));
            }
            if rule.target.split('/').any(|part| part == "..") || rule.target.starts_with('/') {
                errors.push(format!(
                    "Index rule {position} target '{}' must stay inside the install directory",
                    rule.target
                ));
            }
        }

        if self.ignored.iter().any(|entry| entry.is_empty()) {
            errors.push("Ignore list entries cannot be empty".to_string());
        }

        if self.max_file_size == 0 {
            errors.push("Max file size must be greater than 0".to_string());
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Target server address
    pub address: String,

    /// Name checked against the server certificate
    pub server_name: String,

    /// Directory kept in sync
    pub install_dir: PathBuf,

    /// Identifier file, relative to the install directory
    pub identifier_path: PathBuf,

    /// Crash record, relative to the install directory
    pub crash_log_path: PathBuf,

    /// Absolute deadline for a whole sync run
    #[serde(with = "duration_serde")]
    pub connection_deadline: Duration,

    /// Timeout for the TCP connect
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Largest single delta payload the client will allocate
    pub max_payload_size: u64,

    /// Path components never hashed or advertised
    pub excluded_components: Vec<String>,

    /// Directories whose files unknown to the server are deleted
    pub prunable_dirs: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{DEFAULT_PORT}"),
            server_name: String::from("localhost"),
            install_dir: PathBuf::from("."),
            identifier_path: PathBuf::from("config/uuid.bin"),
            crash_log_path: PathBuf::from("ss-error.log"),
            connection_deadline: timeout::CONNECTION_DEADLINE,
            connect_timeout: timeout::CONNECT_TIMEOUT,
            max_payload_size: MAX_FILE_SIZE,
            excluded_components: ["assets", "screenshots", "saves", "library"]
                .into_iter()
                .map(String::from)
                .collect(),
            prunable_dirs: vec![String::from("mods")],
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if !self.address.contains(':') {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: 'example.com:48879')",
                self.address
            ));
        }

        if self.server_name.is_empty() {
            errors.push("Server name cannot be empty".to_string());
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        }

        if self.connection_deadline < self.connect_timeout {
            errors.push("Connection deadline must not be shorter than the connect timeout".to_string());
        }

        if self.max_payload_size == 0 {
            errors.push("Max payload size must be greater than 0".to_string());
        }

        if self.identifier_path.is_absolute() || self.crash_log_path.is_absolute() {
            errors.push("Identifier and crash log paths must be relative to the install directory".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("ssproto"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
