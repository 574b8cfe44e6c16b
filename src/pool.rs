//! Pooled HTTP client for site backends
//!
//! Every site backend listens on `127.0.0.1:<internal_port>`. One client is
//! shared by all sites so idle keep-alive connections are reused across
//! requests to the same backend.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request body type accepted by the pooled client
pub type OutboundBody = BoxBody<Bytes, BoxError>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("backend request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("cannot build backend request: {0}")]
    RequestBuild(String),
}

impl PoolError {
    /// True when no connection to the backend could be established
    pub fn is_connect(&self) -> bool {
        matches!(self, PoolError::Client(e) if e.is_connect())
    }
}

#[derive(Debug, Default)]
pub struct PoolStats {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl From<&crate::config::ServerSettings> for PoolConfig {
    fn from(settings: &crate::config::ServerSettings) -> Self {
        Self {
            max_idle_per_host: settings.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(settings.pool_idle_timeout_secs),
        }
    }
}

pub struct ConnectionPool {
    client: Client<HttpConnector, OutboundBody>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Backend connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to `127.0.0.1:<port>` at `path_and_query`.
    ///
    /// The caller prepares the header map; it is sent as is.
    pub async fn send<B>(
        &self,
        method: Method,
        port: u16,
        path_and_query: &str,
        headers: HeaderMap,
        body: B,
    ) -> Result<Response<Incoming>, PoolError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let uri = format!("http://127.0.0.1:{}{}", port, path_and_query);

        let mut backend_req = Request::builder()
            .method(method)
            .uri(&uri)
            .body(body.map_err(Into::into).boxed())
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;
        *backend_req.headers_mut() = headers;

        self.stats.record_request();

        match self.client.request(backend_req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.stats.record_failure();
                Err(e.into())
            }
        }
    }
}
