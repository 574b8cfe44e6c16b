use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct GatewayConfig {
    /// Listener and request handling settings
    #[serde(default)]
    pub server: ServerSettings,

    /// On-disk locations of the site topology
    #[serde(default)]
    pub paths: PathSettings,

    /// Automatic certificate settings
    #[serde(default)]
    pub acme: AcmeSettings,

    /// Backend process supervision settings
    #[serde(default)]
    pub backends: BackendSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    /// Bind address for every listener (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port of the shared plain HTTP listener (default: 80)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Port of the shared SNI-multiplexed HTTPS listener (default: 443)
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Upper bound for draining in-flight requests when a listener stops
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Max time to wait for a proxied backend response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle backend connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerSettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathSettings {
    /// Directory holding sites-available/ and sites-enabled/
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
}

impl PathSettings {
    pub fn sites_available(&self) -> PathBuf {
        self.base_dir.join("sites-available")
    }

    pub fn sites_enabled(&self) -> PathBuf {
        self.base_dir.join("sites-enabled")
    }
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
        }
    }
}

/// ACME (Let's Encrypt) settings shared by every automatic-certificate site
#[derive(Debug, Deserialize, Clone)]
pub struct AcmeSettings {
    /// Provision certificates from the ACME directory. When false, only
    /// certificates already present in the cache are served.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Contact email for the ACME account
    pub email: Option<String>,

    /// ACME directory URL (defaults to Let's Encrypt production)
    /// Use "https://acme-staging-v02.api.letsencrypt.org/directory" for testing
    pub directory_url: Option<String>,

    /// Persistent certificate cache, one sub-directory per hostname
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Accept loopback and private addresses in the DNS preflight
    #[serde(default)]
    pub allow_private_addresses: bool,
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            email: None,
            directory_url: None,
            cache_dir: default_cache_dir(),
            allow_private_addresses: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendSettings {
    /// Interpreter used to run a node backend's entry file
    #[serde(default = "default_node_command")]
    pub node_command: String,

    /// Buffered log lines per backend before the readers block
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Time between SIGTERM and SIGKILL when stopping a backend.
    /// Zero kills immediately.
    #[serde(default)]
    pub stop_grace_period_secs: u64,
}

impl BackendSettings {
    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            node_command: default_node_command(),
            log_capacity: default_log_capacity(),
            stop_grace_period_secs: 0,
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/etc/sitegate")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/etc/sitegate/certs-cache")
}

fn default_true() -> bool {
    true
}

fn default_node_command() -> String {
    "node".to_string()
}

fn default_log_capacity() -> usize {
    100
}

impl GatewayConfig {
    /// Load the configuration file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        let content = std::fs::read_to_string(path)?;
        let config: GatewayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.http_port != 0 && self.server.http_port == self.server.https_port {
            anyhow::bail!(
                "http_port and https_port must differ (both are {})",
                self.server.http_port
            );
        }
        if self.server.shutdown_timeout_secs == 0 {
            anyhow::bail!("shutdown_timeout_secs must be greater than zero");
        }
        if self.backends.log_capacity == 0 {
            anyhow::bail!("backends.log_capacity must be greater than zero");
        }
        if self
            .acme
            .cache_dir
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            anyhow::bail!("acme.cache_dir must not contain '..'");
        }
        Ok(())
    }
}
