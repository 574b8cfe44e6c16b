//! Automatic certificates (ACME / Let's Encrypt)
//!
//! Each automatic-certificate host gets a [`CertificateEntry`]. The entry
//! serves HTTP-01 challenge tokens, holds the current certificate and runs
//! its own provisioning task: obtain a certificate if none is cached, then
//! recheck every 12 hours and renew when fewer than 30 days remain.
//!
//! Cache layout:
//!
//! ```text
//! <cache_dir>/account.json
//! <cache_dir>/<host>/cert.pem
//! <cache_dir>/<host>/key.pem    (mode 0600 on unix)
//! ```

use crate::config::AcmeSettings;
use crate::tls::{certified_key, parse_certs, parse_key};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use parking_lot::{Mutex, RwLock};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
const RETRY_INTERVAL: Duration = Duration::from_secs(60 * 60);
const RENEW_BEFORE_DAYS: u64 = 30;
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLL_ATTEMPTS: u32 = 30;

/// Pending HTTP-01 tokens mapped to their key authorizations
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: String, key_authorization: String) {
        self.inner.write().insert(token, key_authorization);
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.inner.read().get(token).cloned()
    }

    pub fn remove(&self, token: &str) {
        self.inner.write().remove(token);
    }
}

/// Certificate state of one automatic-TLS host
pub struct CertificateEntry {
    host: String,
    cache_dir: PathBuf,
    challenges: Http01Challenges,
    current: RwLock<Option<Arc<CertifiedKey>>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CertificateEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateEntry")
            .field("host", &self.host)
            .field("cache_dir", &self.cache_dir)
            .field("has_certificate", &self.has_certificate())
            .finish()
    }
}

impl CertificateEntry {
    fn new(host: &str, cache_root: &Path) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            host: host.to_string(),
            cache_dir: cache_root.join(host),
            challenges: Http01Challenges::new(),
            current: RwLock::new(None),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn challenges(&self) -> &Http01Challenges {
        &self.challenges
    }

    pub fn certified_key(&self) -> Option<Arc<CertifiedKey>> {
        self.current.read().clone()
    }

    pub fn has_certificate(&self) -> bool {
        self.current.read().is_some()
    }

    fn needs_renewal(&self) -> bool {
        self.current
            .read()
            .as_ref()
            .and_then(|key| key.cert.first())
            .map(|cert| !is_cert_valid_for_days(cert, RENEW_BEFORE_DAYS))
            .unwrap_or(true)
    }

    /// Load `cert.pem`/`key.pem` from the host cache if they are present
    /// and not yet expired
    pub fn load_cached(&self) -> bool {
        let cert_path = self.cache_dir.join("cert.pem");
        let key_path = self.cache_dir.join("key.pem");
        if !cert_path.exists() || !key_path.exists() {
            return false;
        }

        let loaded = std::fs::read(&cert_path).and_then(|cert_data| {
            let key_data = std::fs::read(&key_path)?;
            let certs = parse_certs(&mut BufReader::new(&cert_data[..]))?;
            let key = parse_key(&mut BufReader::new(&key_data[..]))?;
            Ok((certs, key))
        });

        let (certs, key) = match loaded {
            Ok((certs, Some(key))) if !certs.is_empty() => (certs, key),
            Ok(_) => {
                warn!(host = %self.host, "Cached certificate is incomplete, ignoring");
                return false;
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "Failed to read cached certificate");
                return false;
            }
        };

        if !is_cert_valid_for_days(&certs[0], 0) {
            info!(host = %self.host, "Cached certificate has expired");
            return false;
        }

        match certified_key(certs, &key) {
            Ok(key) => {
                *self.current.write() = Some(key);
                info!(host = %self.host, path = %cert_path.display(), "Loaded cached certificate");
                true
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "Cached key is not usable");
                false
            }
        }
    }

    fn save_cert(&self, cert_chain_pem: &str, private_key_pem: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.cache_dir)?;

        let cert_path = self.cache_dir.join("cert.pem");
        let key_path = self.cache_dir.join("key.pem");

        std::fs::write(&cert_path, cert_chain_pem)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&key_path)?;
            std::io::Write::write_all(&mut file, private_key_pem.as_bytes())?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(&key_path, private_key_pem)?;
        }

        debug!(host = %self.host, path = %cert_path.display(), "Certificate saved to cache");
        Ok(())
    }

    fn install(&self, cert_chain_pem: &str, private_key_pem: &str) -> anyhow::Result<()> {
        let certs = parse_certs(&mut BufReader::new(cert_chain_pem.as_bytes()))?;
        let key = parse_key(&mut BufReader::new(private_key_pem.as_bytes()))?
            .ok_or_else(|| anyhow::anyhow!("generated key is not valid PEM"))?;
        let key = certified_key(certs, &key)
            .map_err(|e| anyhow::anyhow!("Failed to create signing key: {}", e))?;

        self.save_cert(cert_chain_pem, private_key_pem)?;
        *self.current.write() = Some(key);
        Ok(())
    }

    /// Run one HTTP-01 order for this host; returns the PEM chain and key
    async fn obtain_certificate(&self, account: &Account) -> anyhow::Result<(String, String)> {
        let identifiers = [Identifier::Dns(self.host.clone())];
        info!(host = %self.host, "Requesting new certificate");

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let authorizations = order.authorizations().await?;
        for authz in authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow::anyhow!("HTTP-01 challenge not offered for {}", self.host))?;

            let key_auth = order.key_authorization(challenge);
            debug!(host = %self.host, token = %challenge.token, "Publishing HTTP-01 token");
            self.challenges
                .set(challenge.token.clone(), key_auth.as_str().to_string());

            let outcome = self.await_authorization(&mut order, &challenge.url).await;
            self.challenges.remove(&challenge.token);
            outcome?;
        }

        let mut attempts = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => anyhow::bail!("Order for {} is invalid", self.host),
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("Order for {} timed out", self.host);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order.refresh().await?;
                }
            }
        }

        let mut params = CertificateParams::new(vec![self.host.clone()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, self.host.clone());
        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;

        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let cert_chain_pem = loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => match order.certificate().await? {
                    Some(chain) => break chain,
                    None => anyhow::bail!("Order valid but no certificate returned"),
                },
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("Certificate for {} timed out", self.host);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                _ => anyhow::bail!("Unexpected order status: {:?}", order.state().status),
            }
        };

        info!(host = %self.host, "Certificate obtained");
        Ok((cert_chain_pem, private_key.serialize_pem()))
    }

    async fn await_authorization(
        &self,
        order: &mut instant_acme::Order,
        challenge_url: &str,
    ) -> anyhow::Result<()> {
        order.set_challenge_ready(challenge_url).await?;

        let mut attempts = 0;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            order.refresh().await?;
            let auths = order.authorizations().await?;
            let status = auths
                .iter()
                .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == &self.host))
                .map(|a| a.status.clone());

            match status {
                Some(AuthorizationStatus::Valid) => {
                    info!(host = %self.host, "Authorization valid");
                    return Ok(());
                }
                Some(AuthorizationStatus::Pending) => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("Authorization timeout for {}", self.host);
                    }
                }
                Some(AuthorizationStatus::Invalid) => {
                    anyhow::bail!("Authorization failed for {}", self.host)
                }
                Some(other) => debug!(host = %self.host, status = ?other, "Authorization status"),
                None => anyhow::bail!("Authorization not found for {}", self.host),
            }
        }
    }

    async fn renew_if_needed(&self, accounts: &AccountStore) {
        if !self.needs_renewal() {
            return;
        }
        let result = async {
            let account = accounts.get_or_create().await?;
            let (chain, key) = self.obtain_certificate(&account).await?;
            self.install(&chain, &key)
        }
        .await;

        if let Err(e) = result {
            error!(host = %self.host, error = %e, "Certificate provisioning failed");
        }
    }

    async fn run(self: Arc<Self>, accounts: Arc<AccountStore>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            self.renew_if_needed(&accounts).await;
            let wait = if self.has_certificate() {
                RENEWAL_INTERVAL
            } else {
                RETRY_INTERVAL
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!(host = %self.host, "Certificate task stopping");
                        break;
                    }
                }
            }
        }
    }

    fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// ACME account shared by every entry, persisted in `account.json`
struct AccountStore {
    settings: AcmeSettings,
    account: tokio::sync::Mutex<Option<Account>>,
}

impl AccountStore {
    async fn get_or_create(&self) -> anyhow::Result<Account> {
        let mut cached = self.account.lock().await;
        if let Some(account) = cached.as_ref() {
            return Ok(account.clone());
        }

        let account_path = self.settings.cache_dir.join("account.json");
        let account = if account_path.exists() {
            debug!(path = %account_path.display(), "Loading existing ACME account");
            let data = std::fs::read_to_string(&account_path)?;
            let credentials: AccountCredentials = serde_json::from_str(&data)?;
            Account::from_credentials(credentials).await?
        } else {
            info!("Creating new ACME account");
            let email = self
                .settings
                .email
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("acme.email is required to create an account"))?;
            let directory_url = self
                .settings
                .directory_url
                .as_deref()
                .unwrap_or(LetsEncrypt::Production.url());

            let (account, credentials) = Account::create(
                &NewAccount {
                    contact: &[&format!("mailto:{}", email)],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                directory_url,
                None,
            )
            .await?;

            std::fs::create_dir_all(&self.settings.cache_dir)?;
            std::fs::write(&account_path, serde_json::to_string_pretty(&credentials)?)?;
            info!(path = %account_path.display(), "ACME account credentials saved");
            account
        };

        *cached = Some(account.clone());
        Ok(account)
    }
}

type EntryMap = Arc<RwLock<HashMap<String, Arc<CertificateEntry>>>>;

/// Selects the certificate by SNI among the automatic-TLS hosts
#[derive(Clone)]
pub struct SniResolver {
    entries: EntryMap,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("hosts", &self.entries.read().len())
            .finish()
    }
}

impl SniResolver {
    pub fn certificate_for(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let entry = self
            .entries
            .read()
            .get(&server_name.to_ascii_lowercase())
            .cloned()?;
        entry.certified_key()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name()?;
        let key = self.certificate_for(sni);
        if key.is_none() {
            debug!(sni, "No certificate for requested server name");
        }
        key
    }
}

/// Owns the certificate entries of every automatic-TLS host
pub struct CertificateManager {
    settings: AcmeSettings,
    entries: EntryMap,
    accounts: Arc<AccountStore>,
}

impl CertificateManager {
    pub fn new(settings: AcmeSettings) -> Self {
        let accounts = Arc::new(AccountStore {
            settings: settings.clone(),
            account: tokio::sync::Mutex::new(None),
        });
        Self {
            settings,
            entries: Arc::new(RwLock::new(HashMap::new())),
            accounts,
        }
    }

    /// DNS preflight, then create (or reuse) the entry for `host`.
    ///
    /// Returns `None` when the host does not resolve to an address of this
    /// machine; the site is then served over plain HTTP only.
    pub async fn prepare(&self, host: &str) -> Option<Arc<CertificateEntry>> {
        let host = host.to_ascii_lowercase();
        if !is_cacheable_host(&host) {
            warn!(host = %host, "Host name cannot be used for automatic certificates");
            return None;
        }

        if let Some(entry) = self.entry(&host) {
            return Some(entry);
        }

        match resolves_locally(&host, self.settings.allow_private_addresses).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    host = %host,
                    "Host does not resolve to this machine, skipping automatic certificate"
                );
                return None;
            }
            Err(e) => {
                warn!(host = %host, error = %e, "DNS preflight failed, skipping automatic certificate");
                return None;
            }
        }

        let entry = Arc::new(CertificateEntry::new(&host, &self.settings.cache_dir));
        entry.load_cached();

        let mut entries = self.entries.write();
        let entry = entries.entry(host).or_insert(entry);
        Some(Arc::clone(entry))
    }

    pub fn entry(&self, host: &str) -> Option<Arc<CertificateEntry>> {
        self.entries.read().get(&host.to_ascii_lowercase()).cloned()
    }

    pub fn has_entry(&self, host: &str) -> bool {
        self.entries.read().contains_key(&host.to_ascii_lowercase())
    }

    pub fn has_entries(&self) -> bool {
        !self.entries.read().is_empty()
    }

    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.entries.read().keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Key authorization for a pending HTTP-01 token of `host`
    pub fn challenge_response(&self, host: &str, token: &str) -> Option<String> {
        self.entry(host)?.challenges.get(token)
    }

    pub fn resolver(&self) -> Arc<SniResolver> {
        Arc::new(SniResolver {
            entries: Arc::clone(&self.entries),
        })
    }

    /// Spawn the provisioning task of `entry` unless one is already running.
    /// With ACME disabled only cached certificates are served.
    pub fn start_provisioning(&self, entry: &Arc<CertificateEntry>) {
        if !self.settings.enabled {
            if !entry.has_certificate() {
                warn!(host = %entry.host, "ACME disabled and no cached certificate");
            }
            return;
        }

        let mut task = entry.task.lock();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        entry.shutdown_tx.send_replace(false);
        *task = Some(tokio::spawn(
            Arc::clone(entry).run(Arc::clone(&self.accounts)),
        ));
        debug!(host = %entry.host, "Certificate provisioning started");
    }

    /// Drop every entry and stop its provisioning task
    pub fn clear(&self) {
        let drained: Vec<Arc<CertificateEntry>> =
            self.entries.write().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            entry.stop();
        }
    }
}

impl Drop for CertificateManager {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Host names end up as cache directory names
fn is_cacheable_host(host: &str) -> bool {
    !host.is_empty()
        && host != "."
        && host != ".."
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

async fn resolves_locally(host: &str, allow_private: bool) -> std::io::Result<bool> {
    let addrs = tokio::net::lookup_host((host, 443)).await?;
    Ok(addrs
        .map(|addr| addr.ip())
        .any(|ip| is_local_address(ip, allow_private)))
}

/// An address is local when a socket can be bound to it. In relaxed mode
/// loopback and private ranges also count.
pub(crate) fn is_local_address(ip: IpAddr, allow_private: bool) -> bool {
    if allow_private {
        let private = match ip {
            IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
            IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
        };
        if private {
            return true;
        }
    }
    std::net::UdpSocket::bind((ip, 0)).is_ok()
}

fn is_cert_valid_for_days(cert: &CertificateDer<'_>, days: u64) -> bool {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(cert.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Failed to parse X.509 certificate");
            return false;
        }
    };

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let remaining_secs = parsed.validity().not_after.timestamp() - now;
    if remaining_secs < 0 {
        return false;
    }

    let remaining_days = remaining_secs as u64 / (24 * 60 * 60);
    if remaining_days < days {
        info!(remaining_days, required_days = days, "Certificate expires soon");
        return false;
    }
    true
}
