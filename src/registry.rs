use crate::router::SiteHandler;
use crate::site::SiteConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Name of the entry served when no site matches a request host
pub const DEFAULT_SITE: &str = "default";

/// A registered site: its configuration, its request handler and whether
/// a listener currently serves it.
pub struct Site {
    pub config: Arc<SiteConfig>,
    pub handler: Arc<SiteHandler>,
    running: Mutex<bool>,
}

impl Site {
    pub fn new(config: Arc<SiteConfig>, handler: Arc<SiteHandler>) -> Self {
        Self {
            config,
            handler,
            running: Mutex::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.server_name
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock()
    }

    pub fn set_running(&self, running: bool) {
        *self.running.lock() = running;
    }
}

impl std::fmt::Debug for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Site")
            .field("server_name", &self.config.server_name)
            .field("listen", &self.config.listen)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Host name to site mapping, replaced wholesale on reload
#[derive(Default)]
pub struct VirtualHostRegistry {
    sites: Mutex<Arc<HashMap<String, Arc<Site>>>>,
}

impl VirtualHostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for `name`
    pub fn register(&self, name: &str, site: Arc<Site>) {
        let mut sites = self.sites.lock();
        Arc::make_mut(&mut *sites).insert(name.to_ascii_lowercase(), site);
    }

    /// Exact match, falling back to the `default` entry
    pub fn lookup(&self, name: &str) -> Option<Arc<Site>> {
        let sites = self.snapshot();
        sites
            .get(&name.to_ascii_lowercase())
            .or_else(|| sites.get(DEFAULT_SITE))
            .cloned()
    }

    /// Exact match only
    pub fn get(&self, name: &str) -> Option<Arc<Site>> {
        self.snapshot().get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Site>> {
        let mut sites = self.sites.lock();
        Arc::make_mut(&mut *sites).remove(&name.to_ascii_lowercase())
    }

    /// Drop every entry at once. Lookups see either the old map or the
    /// empty one, never a partial state.
    pub fn clear(&self) {
        *self.sites.lock() = Arc::new(HashMap::new());
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn sites(&self) -> Vec<Arc<Site>> {
        self.snapshot().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<HashMap<String, Arc<Site>>> {
        Arc::clone(&self.sites.lock())
    }
}
