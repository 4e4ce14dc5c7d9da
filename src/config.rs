use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Placeholder SKU shipped in sample env files; treated as "not configured"
pub const PLACEHOLDER_SKU_ID: &str = "your-app-sku-id";

/// Default metering endpoint for photon consumption
pub const DEFAULT_METERING_ENDPOINT: &str =
    "https://openapi.dp.tech/openapi/v1/api/integral/consume";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Server configuration settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener and connection settings
    pub server: ListenConfig,

    /// CLI subprocess settings
    pub cli: CliConfig,

    /// Session persistence
    pub storage: StorageConfig,

    /// Filesystem confinement and quotas
    pub paths: PathsConfig,

    /// Photon metering
    pub billing: BillingConfig,

    /// Caller identity resolution
    pub identity: IdentityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
    /// Interval between WebSocket pings; a client silent for a full interval is dropped
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Path or name of the CLI binary
    pub binary: String,
    pub default_model: String,
    /// Prefix for server-generated session IDs
    pub session_prefix: String,
    /// Number of prior messages rendered into the resume context
    pub context_messages: usize,
    /// Abort an invocation after this long without any output. None disables it.
    pub output_timeout_secs: Option<u64>,
    /// Grace period between SIGTERM and SIGKILL on abort
    pub abort_grace_ms: u64,
    /// Reject a second command for a session key that already has a live process
    pub single_flight: bool,
    /// Config file inspected for MCP servers (defaults to ~/.gemini.json)
    pub mcp_config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one JSON file per session
    pub sessions_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Confinement root for project paths, shell sessions and file access
    pub shell_root: Option<PathBuf>,
    /// Base directory for per-user roots
    pub user_data_base: PathBuf,
    /// Disk quota per user root
    pub quota_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Global switch; when false every invocation resolves to `no_billing`
    pub enabled: bool,
    /// Mock mode skips the metering API entirely
    pub mock: bool,
    /// Dev mode allows falling back to `dev_access_key` when no cookie is present
    pub dev_mode: bool,
    pub dev_access_key: Option<String>,
    /// Fallback client name when the request carries none
    pub client_name: Option<String>,
    pub sku_id: Option<String>,
    pub whitelist_access_keys: Vec<String>,
    pub whitelist_users: Vec<String>,
    pub endpoint: String,
    pub scene: String,
    /// Flat fee charged once per accepted command
    pub per_message_photons: u64,
    /// Rate applied to token deltas, in photons per 1000 tokens
    pub photons_per_1k_tokens: u64,
    pub request_timeout_secs: u64,
    /// Abort the running subprocess when a mid-stream or final charge fails
    pub fatal_on_billing_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Header set by the authenticating proxy in front of this server
    pub user_header: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4008,
            heartbeat_interval_secs: 30,
        }
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            binary: "gemini".to_string(),
            default_model: "gemini-2.5-flash".to_string(),
            session_prefix: "gemini".to_string(),
            context_messages: 10,
            output_timeout_secs: None,
            abort_grace_ms: 2000,
            single_flight: true,
            mcp_config_path: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let sessions_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".gemini")
            .join("sessions");
        Self { sessions_dir }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            shell_root: None,
            user_data_base: PathBuf::from("/data"),
            quota_bytes: 1_000_000_000,
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mock: false,
            dev_mode: false,
            dev_access_key: None,
            client_name: None,
            sku_id: None,
            whitelist_access_keys: Vec::new(),
            whitelist_users: Vec::new(),
            endpoint: DEFAULT_METERING_ENDPOINT.to_string(),
            scene: "appCustomizeCharge".to_string(),
            per_message_photons: 3,
            photons_per_1k_tokens: 1,
            request_timeout_secs: 10,
            fatal_on_billing_error: false,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user_header: "x-forwarded-user".to_string(),
        }
    }
}

impl ListenConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

impl CliConfig {
    pub fn output_timeout(&self) -> Option<Duration> {
        self.output_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }
}

impl BillingConfig {
    /// SKU if configured and not the sample placeholder
    pub fn effective_sku(&self) -> Option<&str> {
        self.sku_id
            .as_deref()
            .map(str::trim)
            .filter(|sku| !sku.is_empty() && *sku != PLACEHOLDER_SKU_ID)
    }
}

impl ServerConfig {
    /// Load configuration from file (if present) and overlay process environment
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => {
                info!("No config file found, using defaults");
                Self::default()
            }
        };
        config.apply_env_with(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the config file path: $GEMINI_RELAY_CONFIG or the per-user config dir
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("GEMINI_RELAY_CONFIG") {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("gemini-relay").join("config.json"))
    }

    /// Overlay environment variables, looked up through `lookup`
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(host) = get("HOST") {
            self.server.host = host;
        }
        if let Some(port) = get("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!("Ignoring invalid PORT value: {}", port),
            }
        }
        if let Some(binary) = get("GEMINI_PATH") {
            self.cli.binary = binary;
        }
        if let Some(model) = get("GEMINI_MODEL") {
            self.cli.default_model = model;
        }
        if let Some(secs) = get("GEMINI_OUTPUT_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(secs) => self.cli.output_timeout_secs = Some(secs),
                Err(_) => warn!("Ignoring invalid GEMINI_OUTPUT_TIMEOUT_SECS value: {}", secs),
            }
        }
        if let Some(flag) = get("GEMINI_SINGLE_FLIGHT") {
            self.cli.single_flight = parse_flag(&flag);
        }
        if let Some(dir) = get("GEMINI_SESSIONS_DIR") {
            self.storage.sessions_dir = PathBuf::from(dir);
        }

        // USER_DATA_ROOT is the single source of truth; SHELL_ROOT is the legacy name
        if let Some(root) = get("USER_DATA_ROOT") {
            self.paths.shell_root = Some(PathBuf::from(&root));
            self.paths.user_data_base = PathBuf::from(root);
        } else if let Some(root) = get("SHELL_ROOT") {
            self.paths.shell_root = Some(PathBuf::from(root));
        }
        if let Some(quota) = get("USER_QUOTA_BYTES") {
            match quota.parse() {
                Ok(quota) => self.paths.quota_bytes = quota,
                Err(_) => warn!("Ignoring invalid USER_QUOTA_BYTES value: {}", quota),
            }
        }

        if let Some(flag) = get("PHOTON_MOCK") {
            self.billing.mock = flag == "1";
        }
        if let Some(flag) = get("PHOTON_DEV_MODE") {
            self.billing.dev_mode = parse_flag(&flag);
        }
        if let Some(key) = get("DEV_ACCESS_KEY") {
            self.billing.dev_access_key = Some(key);
        }
        if let Some(name) = get("CLIENT_NAME") {
            self.billing.client_name = Some(name);
        }
        if let Some(sku) = get("PHOTON_SKU_ID").or_else(|| get("SKU_ID")) {
            self.billing.sku_id = Some(sku);
        }
        if let Some(keys) = get("PHOTON_WHITELIST_ACCESS_KEYS") {
            self.billing.whitelist_access_keys = split_list(&keys);
        }
        if let Some(users) = get("PHOTON_WHITELIST_USERS") {
            self.billing.whitelist_users = split_list(&users);
        }
        if let Some(flag) = get("PHOTON_FATAL_ON_BILLING_ERROR") {
            self.billing.fatal_on_billing_error = parse_flag(&flag);
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
