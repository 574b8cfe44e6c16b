//! Site configuration records and the `.conf` directive format
//!
//! A site file holds one directive per line:
//!
//! ```text
//! server_name  example.com
//! listen       80
//! root         /var/www/example
//! spa_rewrite  /app index.html
//! backend      /api /var/www/example/api
//! backend_file server.js
//! backend_internal_port 3000
//! ```

use crate::error::{GatewayError, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Port used when a site file has no `listen` directive
pub const DEFAULT_LISTEN_PORT: u16 = 80;

/// Parsed description of one site. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteConfig {
    /// Hostname or IP, unique across enabled sites
    pub server_name: String,
    pub listen: u16,
    /// Root directory of the static assets
    pub root: PathBuf,
    pub spa_rewrite: Option<SpaRewrite>,
    /// Custom error page directory, relative paths resolve against `root`
    pub error_pages_dir: Option<PathBuf>,
    pub tls: TlsSettings,
    pub backend: Option<BackendConfig>,
}

/// Unmatched paths under `prefix` are answered with `fallback`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaRewrite {
    pub prefix: String,
    pub fallback: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    pub enabled: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Obtain the certificate automatically; overrides the file fields
    pub auto_cert: bool,
}

/// The only backend flavour the supervisor knows how to launch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    #[default]
    Node,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "node" | "nodejs" => Ok(BackendKind::Node),
            other => Err(format!("unsupported backend kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Path prefix proxied to the backend, e.g. `/api`
    pub route: String,
    pub kind: BackendKind,
    /// Working directory of the backend process
    pub dir: PathBuf,
    pub entry_file: String,
    /// Port the backend listens on, on localhost
    pub internal_port: u16,
}

impl BackendConfig {
    pub fn entry_path(&self) -> PathBuf {
        self.dir.join(&self.entry_file)
    }
}

impl SiteConfig {
    /// Minimal plain-HTTP static site
    pub fn new(server_name: &str, listen: u16, root: impl Into<PathBuf>) -> Self {
        Self {
            server_name: server_name.to_string(),
            listen,
            root: root.into(),
            spa_rewrite: None,
            error_pages_dir: None,
            tls: TlsSettings::default(),
            backend: None,
        }
    }

    pub fn with_spa_rewrite(mut self, prefix: &str, fallback: &str) -> Self {
        self.spa_rewrite = Some(SpaRewrite {
            prefix: prefix.to_string(),
            fallback: fallback.to_string(),
        });
        self
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_manual_tls(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.tls.enabled = true;
        self.tls.cert_file = Some(cert.into());
        self.tls.key_file = Some(key.into());
        self
    }

    pub fn with_auto_cert(mut self) -> Self {
        self.tls.enabled = true;
        self.tls.auto_cert = true;
        self
    }

    pub fn wants_auto_cert(&self) -> bool {
        self.tls.auto_cert
    }

    /// Manual certificate files apply only when automatic TLS is off
    pub fn uses_manual_tls(&self) -> bool {
        self.tls.enabled && !self.tls.auto_cert
    }

    pub fn error_pages_dir(&self) -> PathBuf {
        match &self.error_pages_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.root.join(dir),
            None => self.root.join("errors"),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let name = if self.server_name.is_empty() {
            "<unnamed>"
        } else {
            self.server_name.as_str()
        };
        if self.server_name.is_empty() {
            return Err(GatewayError::config(name, "missing server_name"));
        }
        if self.root.as_os_str().is_empty() {
            return Err(GatewayError::config(name, "missing root"));
        }
        if let Some(rewrite) = &self.spa_rewrite {
            if !rewrite.prefix.starts_with('/') || rewrite.fallback.is_empty() {
                return Err(GatewayError::config(
                    name,
                    "spa_rewrite needs a '/'-prefixed path and a fallback file",
                ));
            }
        }
        if let Some(backend) = &self.backend {
            if !backend.route.starts_with('/') {
                return Err(GatewayError::config(name, "backend route must start with '/'"));
            }
            if backend.internal_port == 0 {
                return Err(GatewayError::config(
                    name,
                    "backend route requires a non-zero backend_internal_port",
                ));
            }
        }
        if self.uses_manual_tls() && (self.tls.cert_file.is_none() || self.tls.key_file.is_none()) {
            return Err(GatewayError::config(
                name,
                "ssl_enabled requires ssl_cert_file and ssl_key_file",
            ));
        }
        Ok(())
    }
}

/// Reject two sites sharing the same host and port
pub fn validate_sites(sites: &[SiteConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for site in sites {
        if !seen.insert((site.server_name.as_str(), site.listen)) {
            return Err(GatewayError::DuplicateSite {
                server_name: site.server_name.clone(),
                port: site.listen,
            });
        }
    }
    Ok(())
}

/// Read and parse a site file
pub fn load_site_conf(path: &Path) -> Result<SiteConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| GatewayError::fs(path, e))?;
    let origin = path.display().to_string();
    parse_site_conf(&content, &origin)
}

/// Parse the directive format. `origin` names the source in error messages.
pub fn parse_site_conf(content: &str, origin: &str) -> Result<SiteConfig> {
    let mut config = SiteConfig::new("", DEFAULT_LISTEN_PORT, PathBuf::new());
    let mut backend_route: Option<(String, PathBuf)> = None;
    let mut backend_file: Option<String> = None;
    let mut backend_port: Option<u16> = None;
    let mut backend_kind = BackendKind::default();

    for (index, raw) in content.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        let directive = parts[0];
        let args = &parts[1..];
        let invalid = |reason: String| {
            GatewayError::config(origin, format!("line {}: {}", line_no, reason))
        };
        let need = |count: usize| -> Result<()> {
            if args.len() < count {
                Err(invalid(format!(
                    "'{}' expects {} argument(s)",
                    directive, count
                )))
            } else {
                Ok(())
            }
        };

        match directive {
            "server_name" => {
                need(1)?;
                config.server_name = args[0].to_string();
            }
            "listen" => {
                need(1)?;
                config.listen = parse_port(args[0]).map_err(&invalid)?;
            }
            "root" => {
                need(1)?;
                config.root = PathBuf::from(args[0]);
            }
            "spa_rewrite" | "vuejs_rewrite" => {
                need(2)?;
                config.spa_rewrite = Some(SpaRewrite {
                    prefix: args[0].to_string(),
                    fallback: args[1].to_string(),
                });
            }
            "error_pages_dir" => {
                need(1)?;
                config.error_pages_dir = Some(PathBuf::from(args[0]));
            }
            "ssl_enabled" => {
                need(1)?;
                config.tls.enabled = parse_bool(args[0]).map_err(&invalid)?;
            }
            "ssl_cert_file" => {
                need(1)?;
                config.tls.cert_file = Some(PathBuf::from(args[0]));
            }
            "ssl_key_file" => {
                need(1)?;
                config.tls.key_file = Some(PathBuf::from(args[0]));
            }
            "use_lets_encrypt" | "auto_cert" => {
                need(1)?;
                config.tls.auto_cert = parse_bool(args[0]).map_err(&invalid)?;
            }
            "backend" => {
                need(2)?;
                backend_route = Some((args[0].to_string(), PathBuf::from(args[1])));
            }
            "backend_file" => {
                need(1)?;
                backend_file = Some(args[0].to_string());
            }
            "backend_kind" => {
                need(1)?;
                backend_kind = args[0].parse().map_err(&invalid)?;
            }
            "backend_internal_port" => {
                need(1)?;
                backend_port = Some(parse_port(args[0]).map_err(&invalid)?);
            }
            unknown => {
                warn!(origin, line = line_no, directive = unknown, "Ignoring unknown directive");
            }
        }
    }

    match backend_route {
        Some((route, dir)) => {
            config.backend = Some(BackendConfig {
                route,
                kind: backend_kind,
                dir,
                entry_file: backend_file.unwrap_or_default(),
                internal_port: backend_port.unwrap_or(0),
            });
        }
        None if backend_file.is_some() || backend_port.is_some() => {
            return Err(GatewayError::config(
                origin,
                "backend_file/backend_internal_port given without a backend directive",
            ));
        }
        None => {}
    }

    Ok(config)
}

fn parse_port(value: &str) -> std::result::Result<u16, String> {
    value
        .parse::<u16>()
        .map_err(|_| format!("invalid port '{}'", value))
}

fn parse_bool(value: &str) -> std::result::Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Ok(true),
        "false" | "0" | "off" | "no" => Ok(false),
        other => Err(format!("invalid boolean '{}'", other)),
    }
}
