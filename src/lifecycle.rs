//! Site lifecycle: init, start, stop, reload and shutdown
//!
//! Every site is registered under its lowercased `server_name`. A started
//! site is served in one of four placements:
//!
//! | placement       | when                                   | listener              |
//! |-----------------|----------------------------------------|-----------------------|
//! | `SharedTls`     | the site holds a certificate entry     | shared HTTPS + HTTP   |
//! | `DedicatedTls`  | TLS with certificate files             | own port, own cert    |
//! | `SharedHttp`    | plain, `listen == server.http_port`    | shared HTTP           |
//! | `DedicatedHttp` | plain, any other port                  | own port              |
//!
//! Lifecycle operations are serialized by an async mutex. The maps behind
//! them use short `parking_lot` critical sections and are never held
//! across an await point.

use crate::acme::CertificateManager;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::process::BackendSupervisor;
use crate::registry::{Site, VirtualHostRegistry};
use crate::router::{HostDispatcher, RequestHandler, SiteHandler, SiteListener};
use crate::server::{ListenerKind, SiteServer};
use crate::site::SiteConfig;
use crate::tls;
use crate::topology::SiteSource;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const SHARED_HTTP: &str = "shared-http";
const SHARED_HTTPS: &str = "shared-https";

/// Where a started site is served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    SharedTls,
    DedicatedTls,
    SharedHttp,
    DedicatedHttp,
}

struct ActiveSite {
    config: Arc<SiteConfig>,
    placement: Placement,
    /// Dedicated listener; `None` on the shared listeners
    server: Option<Arc<SiteServer>>,
}

/// Outcome of a reload
#[derive(Debug, Default)]
pub struct ReloadReport {
    /// Sites serving after the reload, sorted
    pub running: Vec<String>,
    /// Sites that failed to initialize or start
    pub failed: Vec<(String, GatewayError)>,
}

pub struct ServerManager {
    config: GatewayConfig,
    sites: Arc<dyn SiteSource>,
    registry: Arc<VirtualHostRegistry>,
    certificates: Arc<CertificateManager>,
    backends: Arc<BackendSupervisor>,
    pool: Arc<ConnectionPool>,
    dispatcher: Arc<HostDispatcher>,
    active: Mutex<HashMap<String, ActiveSite>>,
    shared_http: Mutex<Option<Arc<SiteServer>>>,
    shared_https: Mutex<Option<Arc<SiteServer>>>,
    ops: tokio::sync::Mutex<()>,
}

impl ServerManager {
    pub fn new(config: GatewayConfig, sites: Arc<dyn SiteSource>) -> Self {
        let registry = Arc::new(VirtualHostRegistry::new());
        let certificates = Arc::new(CertificateManager::new(config.acme.clone()));
        let backends = BackendSupervisor::new(config.backends.clone());
        let pool = Arc::new(ConnectionPool::new(PoolConfig::from(&config.server)));
        let dispatcher = Arc::new(HostDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&certificates),
            config.server.https_port,
        ));

        Self {
            config,
            sites,
            registry,
            certificates,
            backends,
            pool,
            dispatcher,
            active: Mutex::new(HashMap::new()),
            shared_http: Mutex::new(None),
            shared_https: Mutex::new(None),
            ops: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn sites(&self) -> &Arc<dyn SiteSource> {
        &self.sites
    }

    pub fn registry(&self) -> &Arc<VirtualHostRegistry> {
        &self.registry
    }

    pub fn certificates(&self) -> &Arc<CertificateManager> {
        &self.certificates
    }

    pub fn backends(&self) -> &Arc<BackendSupervisor> {
        &self.backends
    }

    /// Validate `config`, build its handler and register it. Automatic TLS
    /// sites also go through the certificate preflight.
    pub async fn init_site(&self, config: SiteConfig) -> Result<()> {
        let _ops = self.ops.lock().await;
        self.init_unlocked(config).await
    }

    pub async fn start_server(&self, name: &str) -> Result<()> {
        let _ops = self.ops.lock().await;
        self.start_unlocked(name)
    }

    /// Gracefully stop the site's listener and backend.
    ///
    /// Fails with `NotRunning` when the site is not started.
    pub async fn stop_server(&self, name: &str) -> Result<()> {
        let _ops = self.ops.lock().await;
        self.stop_unlocked(name).await
    }

    /// Like [`stop_server`](Self::stop_server) but "not running" is success
    pub async fn stop_server_if_running(&self, name: &str) -> Result<()> {
        match self.stop_server(name).await {
            Err(GatewayError::NotRunning(_)) => Ok(()),
            other => other,
        }
    }

    /// Resynchronize with the enabled site set.
    ///
    /// Handlers and certificate entries are rebuilt from disk. Sites that are
    /// still enabled keep their listener unless its port or TLS settings
    /// changed. Sites no longer enabled are stopped. Newly enabled sites are
    /// started.
    pub async fn reload(&self) -> ReloadReport {
        let _ops = self.ops.lock().await;
        self.reload_unlocked().await
    }

    /// Boot: load every enabled site and start it
    pub async fn start_all(&self) -> ReloadReport {
        let report = self.reload().await;
        info!(
            running = report.running.len(),
            failed = report.failed.len(),
            "Gateway started"
        );
        report
    }

    /// True while the site is active and its listener still accepts
    pub fn is_running(&self, name: &str) -> bool {
        self.active
            .lock()
            .get(&name.to_ascii_lowercase())
            .is_some_and(|a| self.is_live(a))
    }

    pub fn placement(&self, name: &str) -> Option<Placement> {
        self.active
            .lock()
            .get(&name.to_ascii_lowercase())
            .map(|a| a.placement)
    }

    /// Bound address of the site's dedicated listener
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.active
            .lock()
            .get(&name.to_ascii_lowercase())
            .and_then(|a| a.server.as_ref().map(|s| s.local_addr()))
    }

    pub fn running_sites(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .active
            .lock()
            .iter()
            .filter(|(_, a)| self.is_live(a))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Stop every listener and every backend. Returns the first shutdown
    /// error after everything has been stopped.
    pub async fn shutdown(&self) -> Result<()> {
        let _ops = self.ops.lock().await;
        info!("Shutting down all sites");

        let active: Vec<(String, ActiveSite)> = self.active.lock().drain().collect();
        for (name, _) in &active {
            if let Some(site) = self.registry.get(name) {
                site.set_running(false);
            }
        }

        let mut servers: Vec<Arc<SiteServer>> =
            active.into_iter().filter_map(|(_, a)| a.server).collect();
        servers.extend(self.shared_https.lock().take());
        servers.extend(self.shared_http.lock().take());

        let results = futures::future::join_all(servers.iter().map(|s| s.stop())).await;
        self.backends.stop_all().await;
        self.certificates.clear();

        let stats = self.pool.stats();
        info!(
            proxied = stats.get_total_requests(),
            failed = stats.get_failed_requests(),
            "Backend proxy totals"
        );

        results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))
    }

    async fn init_unlocked(&self, config: SiteConfig) -> Result<()> {
        config.validate()?;

        let key = config.server_name.to_ascii_lowercase();
        let config = Arc::new(config);
        let handler = Arc::new(SiteHandler::new(
            Arc::clone(&config),
            Arc::clone(&self.pool),
            self.config.server.request_timeout(),
        ));
        let site = Arc::new(Site::new(Arc::clone(&config), handler));
        if self.active.lock().contains_key(&key) {
            site.set_running(true);
        }
        self.registry.register(&key, site);

        if config.wants_auto_cert() && self.certificates.prepare(&key).await.is_none() {
            warn!(site = %key, "Automatic TLS unavailable, serving plain HTTP");
        }

        debug!(site = %key, listen = config.listen, "Site initialized");
        Ok(())
    }

    fn placement_for(&self, key: &str, config: &SiteConfig) -> Placement {
        if self.certificates.has_entry(key) {
            Placement::SharedTls
        } else if config.uses_manual_tls() {
            Placement::DedicatedTls
        } else if config.listen == self.config.server.http_port {
            Placement::SharedHttp
        } else {
            Placement::DedicatedHttp
        }
    }

    fn start_unlocked(&self, name: &str) -> Result<()> {
        let key = name.to_ascii_lowercase();
        let failed = {
            let mut active = self.active.lock();
            match active.get(&key) {
                Some(a) if self.is_live(a) => {
                    return Err(GatewayError::AlreadyRunning(name.to_string()));
                }
                Some(_) => active.remove(&key),
                None => None,
            }
        };
        if failed.is_some() {
            warn!(site = %key, "Listener had failed, starting the site again");
            if let Some(site) = self.registry.get(&key) {
                site.set_running(false);
            }
        }

        let site = self
            .registry
            .get(&key)
            .ok_or_else(|| GatewayError::SiteNotFound(name.to_string()))?;
        let config = Arc::clone(&site.config);
        let placement = self.placement_for(&key, &config);

        let server = match placement {
            Placement::SharedTls => {
                self.ensure_shared_http()?;
                self.ensure_shared_https()?;
                if let Some(entry) = self.certificates.entry(&key) {
                    self.certificates.start_provisioning(&entry);
                }
                None
            }
            Placement::DedicatedTls => {
                let missing = || GatewayError::config(&key, "TLS enabled without certificate files");
                let cert_file = config.tls.cert_file.as_ref().ok_or_else(missing)?;
                let key_file = config.tls.key_file.as_ref().ok_or_else(missing)?;
                // Certificate problems surface here, before anything is bound
                let acceptor = tls::manual_acceptor(&key, cert_file, key_file)?;
                Some(self.bind_dedicated(&key, config.listen, Some(acceptor))?)
            }
            Placement::SharedHttp => {
                self.ensure_shared_http()?;
                None
            }
            Placement::DedicatedHttp => Some(self.bind_dedicated(&key, config.listen, None)?),
        };

        if let Some(backend) = &config.backend {
            if let Err(e) = self.backends.launch(&key, backend) {
                error!(site = %key, error = %e, "Backend failed to launch, serving static content only");
            }
        }

        site.set_running(true);
        self.active.lock().insert(
            key.clone(),
            ActiveSite {
                config,
                placement,
                server,
            },
        );
        info!(site = %key, placement = ?placement, "Site started");
        Ok(())
    }

    async fn stop_unlocked(&self, name: &str) -> Result<()> {
        let key = name.to_ascii_lowercase();
        let active = self
            .active
            .lock()
            .remove(&key)
            .ok_or_else(|| GatewayError::NotRunning(name.to_string()))?;

        if let Some(site) = self.registry.get(&key) {
            site.set_running(false);
        }
        self.backends.stop(&key).await;

        let result = match &active.server {
            Some(server) => server.stop().await,
            None => Ok(()),
        };
        info!(site = %key, "Site stopped");
        result
    }

    async fn reload_unlocked(&self) -> ReloadReport {
        info!("Reloading sites");
        let mut report = ReloadReport::default();

        self.stop_shared_https().await;
        self.registry.clear();
        self.certificates.clear();

        let mut seen = HashSet::new();
        for (dir_name, loaded) in self.sites.enabled_sites() {
            let config = match loaded {
                Ok(config) => config,
                Err(e) => {
                    report.failed.push((dir_name, e));
                    continue;
                }
            };
            let key = config.server_name.to_ascii_lowercase();
            if !seen.insert(key.clone()) {
                let err = GatewayError::DuplicateSite {
                    server_name: config.server_name.clone(),
                    port: config.listen,
                };
                error!(site = %dir_name, error = %err, "Skipping site");
                report.failed.push((dir_name, err));
                continue;
            }
            if let Err(e) = self.init_unlocked(config).await {
                error!(site = %dir_name, error = %e, "Failed to initialize site");
                report.failed.push((dir_name, e));
            }
        }

        let previous: Vec<(String, ActiveSite)> = self.active.lock().drain().collect();
        for (key, active) in previous {
            self.reconcile(key, active).await;
        }

        if self.certificates.has_entries() {
            if let Err(e) = self.ensure_shared_https() {
                error!(error = %e, "Failed to start the shared HTTPS listener");
            }
        }

        for name in self.registry.names() {
            if self.active.lock().contains_key(&name) {
                continue;
            }
            if let Err(e) = self.start_unlocked(&name) {
                error!(site = %name, error = %e, "Failed to start site");
                report.failed.push((name, e));
            }
        }

        report.running = self.running_sites();
        report
    }

    /// Carry a site that was running before a reload over to its new
    /// configuration, or stop it.
    async fn reconcile(&self, key: String, active: ActiveSite) {
        let site = self.registry.get(&key);
        let keep = site.as_ref().is_some_and(|site| {
            self.listener_alive(&active)
                && self.placement_for(&key, &site.config) == active.placement
                && site.config.listen == active.config.listen
                && site.config.tls == active.config.tls
        });

        let site = match site {
            Some(site) if keep => site,
            other => {
                match other {
                    None => info!(site = %key, "Site no longer enabled, stopping"),
                    Some(site) if !self.listener_alive(&active) => {
                        warn!(site = %key, "Listener failed, restarting");
                        site.set_running(false);
                    }
                    Some(site) => {
                        info!(site = %key, "Listener settings changed, restarting");
                        site.set_running(false);
                    }
                }
                self.backends.stop(&key).await;
                if let Some(server) = &active.server {
                    if let Err(e) = server.stop().await {
                        warn!(site = %key, error = %e, "Listener did not stop cleanly");
                    }
                }
                return;
            }
        };

        site.set_running(true);
        if site.config.backend != active.config.backend {
            self.backends.stop(&key).await;
        }
        if let Some(backend) = &site.config.backend {
            if let Err(e) = self.backends.launch(&key, backend) {
                error!(site = %key, error = %e, "Backend failed to launch, serving static content only");
            }
        }
        if active.placement == Placement::SharedTls {
            if let Some(entry) = self.certificates.entry(&key) {
                self.certificates.start_provisioning(&entry);
            }
        }

        debug!(site = %key, "Site kept across reload");
        self.active.lock().insert(
            key,
            ActiveSite {
                config: Arc::clone(&site.config),
                placement: active.placement,
                server: active.server,
            },
        );
    }

    fn socket_addr(&self, site: &str, port: u16) -> Result<SocketAddr> {
        let ip: IpAddr = self.config.server.bind.parse().map_err(|_| {
            GatewayError::config(site, format!("invalid bind address '{}'", self.config.server.bind))
        })?;
        Ok(SocketAddr::new(ip, port))
    }

    fn bind_dedicated(
        &self,
        key: &str,
        port: u16,
        acceptor: Option<tokio_rustls::TlsAcceptor>,
    ) -> Result<Arc<SiteServer>> {
        let handler: Arc<dyn RequestHandler> =
            Arc::new(SiteListener::new(Arc::clone(&self.registry), key));
        SiteServer::bind(
            key,
            self.socket_addr(key, port)?,
            ListenerKind::Dedicated,
            handler,
            acceptor,
            self.config.server.shutdown_timeout(),
        )
    }

    // Lifecycle operations hold `ops`, so no other caller binds the shared
    // listeners between the liveness check and the slot update.
    fn ensure_shared_http(&self) -> Result<()> {
        if slot_running(&self.shared_http) {
            return Ok(());
        }
        let handler: Arc<dyn RequestHandler> = self.dispatcher.clone();
        let server = SiteServer::bind(
            SHARED_HTTP,
            self.socket_addr(SHARED_HTTP, self.config.server.http_port)?,
            ListenerKind::Shared,
            handler,
            None,
            self.config.server.shutdown_timeout(),
        )?;
        self.shared_http.lock().replace(server);
        Ok(())
    }

    fn ensure_shared_https(&self) -> Result<()> {
        if slot_running(&self.shared_https) {
            return Ok(());
        }
        let acceptor = tls::resolver_acceptor(self.certificates.resolver())?;
        let handler: Arc<dyn RequestHandler> = self.dispatcher.clone();
        let server = SiteServer::bind(
            SHARED_HTTPS,
            self.socket_addr(SHARED_HTTPS, self.config.server.https_port)?,
            ListenerKind::Shared,
            handler,
            Some(acceptor),
            self.config.server.shutdown_timeout(),
        )?;
        self.shared_https.lock().replace(server);
        Ok(())
    }

    async fn stop_shared_https(&self) {
        let server = self.shared_https.lock().take();
        if let Some(server) = server {
            if let Err(e) = server.stop().await {
                warn!(error = %e, "Shared HTTPS listener did not stop cleanly");
            }
        }
    }

    pub fn shared_http_addr(&self) -> Option<SocketAddr> {
        self.shared_http.lock().as_ref().map(|s| s.local_addr())
    }

    /// Whether the listener this site was started on can still accept.
    /// The shared HTTPS listener is left out: every reload rebinds it.
    fn listener_alive(&self, active: &ActiveSite) -> bool {
        match &active.server {
            Some(server) => server.is_running(),
            None => slot_running(&self.shared_http),
        }
    }

    fn is_live(&self, active: &ActiveSite) -> bool {
        self.listener_alive(active)
            && (active.placement != Placement::SharedTls || slot_running(&self.shared_https))
    }
}

fn slot_running(slot: &Mutex<Option<Arc<SiteServer>>>) -> bool {
    slot.lock().as_ref().is_some_and(|s| s.is_running())
}
