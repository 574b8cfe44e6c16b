//! On-disk site layout
//!
//! ```text
//! <base_dir>/sites-available/<name>/<name>.conf
//! <base_dir>/sites-enabled/<name> -> ../sites-available/<name>
//! ```
//!
//! A site is enabled when its entry in `sites-enabled` is a symlink.
//! Regular files or directories placed there are ignored.

use crate::error::{GatewayError, Result};
use crate::site::{load_site_conf, SiteConfig};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Source of the set of enabled sites
pub trait SiteSource: Send + Sync {
    /// Every enabled site with its parsed and validated configuration, or
    /// the error that kept it from loading
    fn enabled_sites(&self) -> Vec<(String, Result<SiteConfig>)>;

    /// Parse a single available site
    fn load(&self, name: &str) -> Result<SiteConfig>;

    fn enable(&self, name: &str) -> Result<()>;

    fn disable(&self, name: &str) -> Result<()>;

    fn is_enabled(&self, name: &str) -> bool;

    fn available_sites(&self) -> Vec<String>;
}

/// Filesystem implementation of [`SiteSource`]
#[derive(Debug, Clone)]
pub struct SiteDirectory {
    available: PathBuf,
    enabled: PathBuf,
}

impl SiteDirectory {
    pub fn new(available: impl Into<PathBuf>, enabled: impl Into<PathBuf>) -> Self {
        Self {
            available: available.into(),
            enabled: enabled.into(),
        }
    }

    /// Create both directories if missing
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [&self.available, &self.enabled] {
            std::fs::create_dir_all(dir).map_err(|e| GatewayError::fs(dir, e))?;
        }
        Ok(())
    }

    pub fn site_dir(&self, name: &str) -> PathBuf {
        self.available.join(name)
    }

    pub fn conf_path(&self, name: &str) -> PathBuf {
        self.site_dir(name).join(format!("{}.conf", name))
    }

    fn link_path(&self, name: &str) -> PathBuf {
        self.enabled.join(name)
    }

    fn enabled_names(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.enabled) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.enabled.display(), error = %e, "Cannot read enabled sites");
                return Vec::new();
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_type()
                    .map(|t| t.is_symlink())
                    .unwrap_or(false)
            })
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }
}

impl SiteSource for SiteDirectory {
    fn enabled_sites(&self) -> Vec<(String, Result<SiteConfig>)> {
        self.enabled_names()
            .into_iter()
            .map(|name| {
                let config = self.load(&name).and_then(|config| {
                    config.validate()?;
                    Ok(config)
                });
                if let Err(e) = &config {
                    warn!(site = %name, error = %e, "Enabled site does not load");
                }
                (name, config)
            })
            .collect()
    }

    fn load(&self, name: &str) -> Result<SiteConfig> {
        if !is_valid_site_name(name) {
            return Err(GatewayError::SiteNotFound(name.to_string()));
        }
        let path = self.conf_path(name);
        if !path.is_file() {
            return Err(GatewayError::SiteNotFound(name.to_string()));
        }
        load_site_conf(&path)
    }

    fn enable(&self, name: &str) -> Result<()> {
        if !is_valid_site_name(name) || !self.site_dir(name).is_dir() {
            return Err(GatewayError::SiteNotFound(name.to_string()));
        }
        if self.is_enabled(name) {
            return Err(GatewayError::AlreadyEnabled(name.to_string()));
        }

        let link = self.link_path(name);
        let target = link_target(&self.available, &self.enabled, name);
        symlink(&target, &link).map_err(|e| GatewayError::fs(&link, e))?;
        debug!(site = name, target = %target.display(), "Site enabled");
        Ok(())
    }

    fn disable(&self, name: &str) -> Result<()> {
        if !is_valid_site_name(name) || !self.is_enabled(name) {
            return Err(GatewayError::NotEnabled(name.to_string()));
        }
        let link = self.link_path(name);
        std::fs::remove_file(&link).map_err(|e| GatewayError::fs(&link, e))?;
        debug!(site = name, "Site disabled");
        Ok(())
    }

    fn is_enabled(&self, name: &str) -> bool {
        is_valid_site_name(name)
            && std::fs::symlink_metadata(self.link_path(name))
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false)
    }

    fn available_sites(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.available)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.path().is_dir())
                    .filter_map(|entry| entry.file_name().into_string().ok())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

/// Site names double as path components
fn is_valid_site_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

/// Relative link when both directories share a parent, absolute otherwise
fn link_target(available: &Path, enabled: &Path, name: &str) -> PathBuf {
    match (available.parent(), enabled.parent(), available.file_name()) {
        (Some(a), Some(e), Some(dir)) if a == e => Path::new("..").join(dir).join(name),
        _ => available.join(name),
    }
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}
