//! Request routing for the virtual hosts
//!
//! [`SiteHandler`] answers requests for one site: backend route first,
//! then static files, then the SPA fallback, then the 404 page.
//! [`HostDispatcher`] fronts the shared listeners and picks the site by
//! `Host`. [`SiteListener`] fronts a dedicated per-site listener.

use crate::acme::CertificateManager;
use crate::error::{
    default_error_page, error_page_response, full_body, html_response, GatewayErrorCode,
    ResponseBody, BACKEND_NOTICE,
};
use crate::pool::ConnectionPool;
use crate::registry::VirtualHostRegistry;
use crate::site::SiteConfig;
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, Request, Response, StatusCode, Uri};
use std::io;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that only apply to a single connection
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Maximum hostname length allowed by DNS
const MAX_HOSTNAME_LEN: usize = 253;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Connection facts the handlers need
#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    pub remote_addr: SocketAddr,
    pub is_tls: bool,
}

/// Serves the requests of one listener
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
        conn: ConnInfo,
    ) -> BoxFuture<'static, Response<ResponseBody>>;
}

/// Handler for the requests of one site
pub struct SiteHandler {
    config: Arc<SiteConfig>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
    backend_unreachable: AtomicBool,
}

impl SiteHandler {
    pub fn new(config: Arc<SiteConfig>, pool: Arc<ConnectionPool>, request_timeout: Duration) -> Self {
        Self {
            config,
            pool,
            request_timeout,
            backend_unreachable: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    /// Set after a failed proxy attempt, cleared by the next successful one
    pub fn backend_unreachable(&self) -> bool {
        self.backend_unreachable.load(Ordering::Relaxed)
    }

    pub async fn handle<B>(&self, req: Request<B>, conn: &ConnInfo) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        if let Some(backend) = &self.config.backend {
            if let Some(target) = strip_route(req.uri().path(), &backend.route) {
                let path_and_query = match req.uri().query() {
                    Some(query) => format!("{}?{}", target, query),
                    None => target,
                };
                return self
                    .proxy(req, conn, backend.internal_port, &path_and_query)
                    .await;
            }
        }

        let is_read = matches!(*req.method(), Method::GET | Method::HEAD);
        let is_head = req.method() == Method::HEAD;

        if is_read {
            if let Some(file) = self.resolve_static(req.uri().path()).await {
                if let Some(response) = self.serve_file(&file, StatusCode::OK, is_head).await {
                    return response;
                }
            }

            if let Some(rewrite) = &self.config.spa_rewrite {
                if req.uri().path().starts_with(&rewrite.prefix) {
                    let fallback = self.config.root.join(&rewrite.fallback);
                    if let Some(response) = self.serve_file(&fallback, StatusCode::OK, is_head).await
                    {
                        return response;
                    }
                    warn!(
                        site = %self.config.server_name,
                        fallback = %fallback.display(),
                        "SPA fallback file is missing"
                    );
                }
            }
        }

        self.not_found(is_head).await
    }

    async fn proxy<B>(
        &self,
        req: Request<B>,
        conn: &ConnInfo,
        port: u16,
        path_and_query: &str,
    ) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        let request_id = parts
            .headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let headers = forwarded_headers(&parts.headers, conn, &request_id);
        let site = self.config.server_name.as_str();

        debug!(site, method = %parts.method, path = path_and_query, request_id = %request_id, "Proxying to backend");

        let result = tokio::time::timeout(
            self.request_timeout,
            self.pool
                .send(parts.method, port, path_and_query, headers, body),
        )
        .await;

        match result {
            Ok(Ok(response)) => {
                if self.backend_unreachable.swap(false, Ordering::Relaxed) {
                    debug!(site, port, "Backend reachable again");
                }
                let (parts, body) = response.into_parts();
                Response::from_parts(parts, body.boxed())
            }
            Ok(Err(e)) if !e.is_connect() => {
                warn!(site, port, request_id = %request_id, error = %e, "Backend request failed");
                error_page_response(GatewayErrorCode::BackendError)
            }
            Ok(Err(e)) => {
                error!(site, port, request_id = %request_id, error = %e, "Backend unreachable");
                self.backend_unreachable.store(true, Ordering::Relaxed);
                let page = default_error_page(StatusCode::BAD_GATEWAY);
                let mut response =
                    html_response(StatusCode::BAD_GATEWAY, inject_notice(page.as_bytes()));
                response.headers_mut().insert(
                    "x-gateway-error",
                    HeaderValue::from_static(GatewayErrorCode::BackendUnreachable.as_header_value()),
                );
                response
            }
            Err(_) => {
                warn!(
                    site,
                    port,
                    request_id = %request_id,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Backend request timed out"
                );
                error_page_response(GatewayErrorCode::BackendTimeout)
            }
        }
    }

    /// Map a request path below the site root. Directories resolve to
    /// their `index.html`. Traversal segments never reach the filesystem.
    async fn resolve_static(&self, path: &str) -> Option<PathBuf> {
        let relative = sanitize_path(path)?;
        let candidate = self.config.root.join(relative);
        let metadata = tokio::fs::metadata(&candidate).await.ok()?;

        if metadata.is_file() {
            return Some(candidate);
        }
        if metadata.is_dir() {
            let index = candidate.join("index.html");
            let is_file = tokio::fs::metadata(&index)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            if is_file {
                return Some(index);
            }
        }
        None
    }

    async fn serve_file(
        &self,
        path: &Path,
        status: StatusCode,
        is_head: bool,
    ) -> Option<Response<ResponseBody>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(site = %self.config.server_name, path = %path.display(), error = %e, "Failed to read file");
                return None;
            }
        };

        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let is_html = mime.type_() == mime_guess::mime::TEXT && mime.subtype() == mime_guess::mime::HTML;
        let body = if is_html && self.backend_unreachable() {
            inject_notice(&bytes)
        } else {
            Bytes::from(bytes)
        };
        let content_type = if is_html {
            "text/html; charset=utf-8".to_string()
        } else {
            mime.to_string()
        };

        Some(build_response(status, &content_type, body, is_head))
    }

    async fn not_found(&self, is_head: bool) -> Response<ResponseBody> {
        let custom = self.config.error_pages_dir().join("404.html");
        if let Some(response) = self.serve_file(&custom, StatusCode::NOT_FOUND, is_head).await {
            return response;
        }

        let mut response = error_page_response(GatewayErrorCode::NotFound);
        if self.backend_unreachable() {
            let page = default_error_page(StatusCode::NOT_FOUND);
            *response.body_mut() = full_body(inject_notice(page.as_bytes()));
        }
        response
    }
}

fn build_response(
    status: StatusCode,
    content_type: &str,
    body: Bytes,
    is_head: bool,
) -> Response<ResponseBody> {
    let builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, body.len());
    let body = if is_head { Bytes::new() } else { body };
    builder
        .body(full_body(body))
        .expect("valid response builder")
}

/// Copy the client headers for the backend, dropping hop-by-hop headers and
/// overwriting the X-Forwarded-* set so clients cannot spoof it
fn forwarded_headers(original: &HeaderMap, conn: &ConnInfo, request_id: &str) -> HeaderMap {
    let mut headers = original.clone();
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&conn.remote_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = original.get(header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    let proto = if conn.is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
    headers
}

/// Path left after removing a backend route prefix, or `None` when the
/// prefix does not match on a segment boundary
pub(crate) fn strip_route(path: &str, route: &str) -> Option<String> {
    let route = route.trim_end_matches('/');
    if route.is_empty() {
        return Some(path.to_string());
    }

    let rest = path.strip_prefix(route)?;
    if rest.is_empty() {
        Some("/".to_string())
    } else if rest.starts_with('/') {
        Some(rest.to_string())
    } else {
        None
    }
}

/// Decode and normalize a request path into a relative filesystem path
fn sanitize_path(path: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(path).ok()?;
    if decoded.contains('\0') || decoded.contains('\\') {
        return None;
    }

    let mut relative = PathBuf::new();
    for component in Path::new(decoded.as_ref()).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(relative)
}

/// Insert the backend notice script before `</body>`, or append it
fn inject_notice(html: &[u8]) -> Bytes {
    let notice = BACKEND_NOTICE.as_bytes();
    let position = html
        .windows(7)
        .rposition(|w| w.eq_ignore_ascii_case(b"</body>"));

    let mut out = Vec::with_capacity(html.len() + notice.len());
    match position {
        Some(at) => {
            out.extend_from_slice(&html[..at]);
            out.extend_from_slice(notice);
            out.extend_from_slice(&html[at..]);
        }
        None => {
            out.extend_from_slice(html);
            out.extend_from_slice(notice);
        }
    }
    Bytes::from(out)
}

/// Request host without port, lowercased; `None` when missing or invalid.
///
/// HTTP/2 clients send `:authority` instead of a `Host` header, which
/// hyper exposes as the request URI authority.
pub(crate) fn extract_hostname(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let raw = match headers.get(header::HOST) {
        Some(value) => value.to_str().ok()?,
        None => uri.host()?,
    };
    let hostname = if raw.starts_with('[') {
        // Bracketed IPv6 literal
        raw.split(']').next()?.trim_start_matches('[')
    } else {
        raw.split(':').next()?
    };

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ':')
    {
        return None;
    }
    Some(hostname.to_ascii_lowercase())
}

/// 301 to the HTTPS origin of the same host and path
fn https_redirect(host: &str, path_and_query: &str, https_port: u16) -> Response<ResponseBody> {
    let location = if https_port == 443 {
        format!("https://{}{}", host, path_and_query)
    } else {
        format!("https://{}:{}{}", host, https_port, path_and_query)
    };

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(header::LOCATION, location)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(full_body("Redirecting to HTTPS"))
        .expect("valid response builder")
}

/// Front handler of the shared HTTP and HTTPS listeners
pub struct HostDispatcher {
    registry: Arc<VirtualHostRegistry>,
    certificates: Arc<CertificateManager>,
    https_port: u16,
}

impl HostDispatcher {
    pub fn new(
        registry: Arc<VirtualHostRegistry>,
        certificates: Arc<CertificateManager>,
        https_port: u16,
    ) -> Self {
        Self {
            registry,
            certificates,
            https_port,
        }
    }

    pub async fn dispatch<B>(&self, req: Request<B>, conn: &ConnInfo) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let hostname = extract_hostname(req.headers(), req.uri());

        if let (Some(host), Some(token)) = (
            hostname.as_deref(),
            req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX),
        ) {
            if let Some(key_auth) = self.certificates.challenge_response(host, token) {
                debug!(host, token, "Responding to ACME HTTP-01 challenge");
                return Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "text/plain")
                    .body(full_body(key_auth))
                    .expect("valid response builder");
            }
        }

        let host = hostname.unwrap_or_default();
        let site = match self.registry.lookup(&host) {
            Some(site) if site.is_running() => site,
            Some(site) => {
                debug!(host = %host, site = %site.name(), "Site is stopped");
                return error_page_response(GatewayErrorCode::UnknownHost);
            }
            None => {
                debug!(host = %host, "No site for host");
                return error_page_response(GatewayErrorCode::UnknownHost);
            }
        };

        if !conn.is_tls {
            let secured = self
                .certificates
                .entry(site.name())
                .map(|entry| entry.has_certificate())
                .unwrap_or(false);
            if secured && !host.is_empty() {
                let path_and_query = req
                    .uri()
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/");
                return https_redirect(&host, path_and_query, self.https_port);
            }
        }

        site.handler.handle(req, conn).await
    }
}

impl RequestHandler for HostDispatcher {
    fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
        conn: ConnInfo,
    ) -> BoxFuture<'static, Response<ResponseBody>> {
        Box::pin(async move { self.dispatch(req, &conn).await })
    }
}

/// Front handler of a dedicated per-site listener. The site is looked up
/// on every request so a reload takes effect without rebinding.
pub struct SiteListener {
    registry: Arc<VirtualHostRegistry>,
    name: String,
}

impl SiteListener {
    pub fn new(registry: Arc<VirtualHostRegistry>, name: &str) -> Self {
        Self {
            registry,
            name: name.to_string(),
        }
    }

    pub async fn dispatch<B>(&self, req: Request<B>, conn: &ConnInfo) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        match self.registry.get(&self.name) {
            Some(site) => site.handler.handle(req, conn).await,
            None => {
                debug!(site = %self.name, "Site no longer registered");
                error_page_response(GatewayErrorCode::UnknownHost)
            }
        }
    }
}

impl RequestHandler for SiteListener {
    fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
        conn: ConnInfo,
    ) -> BoxFuture<'static, Response<ResponseBody>> {
        Box::pin(async move { self.dispatch(req, &conn).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcmeSettings;
    use crate::pool::PoolConfig;
    use crate::registry::{Site, DEFAULT_SITE};
    use crate::site::{BackendConfig, BackendKind};
    use http_body_util::{Empty, Full};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn conn() -> ConnInfo {
        ConnInfo {
            remote_addr: "192.0.2.10:5000".parse().unwrap(),
            is_tls: false,
        }
    }

    fn request(method: Method, host: &str, path: &str) -> Request<Empty<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, host)
            .body(Empty::new())
            .unwrap()
    }

    fn handler(config: SiteConfig) -> SiteHandler {
        SiteHandler::new(
            Arc::new(config),
            Arc::new(ConnectionPool::new(PoolConfig::default())),
            Duration::from_secs(2),
        )
    }

    async fn body_string(response: Response<ResponseBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn site_root() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join("index.html"),
            "<html><body>home</body></html>",
        )
        .unwrap();
        std::fs::create_dir_all(root.path().join("docs")).unwrap();
        std::fs::write(root.path().join("docs/index.html"), "<p>docs</p>").unwrap();
        std::fs::write(root.path().join("style.css"), "body{}").unwrap();
        root
    }

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn backend(port: u16) -> BackendConfig {
        BackendConfig {
            route: "/api".to_string(),
            kind: BackendKind::Node,
            dir: PathBuf::from("/srv/api"),
            entry_file: "server.js".to_string(),
            internal_port: port,
        }
    }

    /// One-shot HTTP backend that records the request head and answers
    async fn spawn_echo_backend() -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = stream.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\nfrom-be")
                .await
                .unwrap();
            head
        });
        (port, handle)
    }

    #[test]
    fn test_strip_route() {
        assert_eq!(strip_route("/api", "/api").as_deref(), Some("/"));
        assert_eq!(strip_route("/api/users", "/api").as_deref(), Some("/users"));
        assert_eq!(strip_route("/api/users", "/api/").as_deref(), Some("/users"));
        assert_eq!(strip_route("/apiary", "/api"), None);
        assert_eq!(strip_route("/other", "/api"), None);
        assert_eq!(strip_route("/anything", "/").as_deref(), Some("/anything"));
    }

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("/a/b.txt"), Some(PathBuf::from("a/b.txt")));
        assert_eq!(sanitize_path("/"), Some(PathBuf::new()));
        assert_eq!(sanitize_path("/a%20b.txt"), Some(PathBuf::from("a b.txt")));
        assert_eq!(sanitize_path("/../etc/passwd"), None);
        assert_eq!(sanitize_path("/a/%2e%2e/%2e%2e/etc"), None);
    }

    #[test]
    fn test_extract_hostname() {
        let origin_form: Uri = "/index.html".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(extract_hostname(&headers, &origin_form), None);

        headers.insert(header::HOST, HeaderValue::from_static("Example.COM:8080"));
        assert_eq!(
            extract_hostname(&headers, &origin_form).as_deref(),
            Some("example.com")
        );

        headers.insert(header::HOST, HeaderValue::from_static("[::1]:8080"));
        assert_eq!(extract_hostname(&headers, &origin_form).as_deref(), Some("::1"));

        headers.insert(header::HOST, HeaderValue::from_static("bad host"));
        assert_eq!(extract_hostname(&headers, &origin_form), None);
    }

    #[test]
    fn test_extract_hostname_from_authority() {
        let headers = HeaderMap::new();
        let uri: Uri = "https://A.Test:8443/page".parse().unwrap();
        assert_eq!(extract_hostname(&headers, &uri).as_deref(), Some("a.test"));

        let uri: Uri = "https://[::1]:8443/".parse().unwrap();
        assert_eq!(extract_hostname(&headers, &uri).as_deref(), Some("::1"));

        // An explicit Host header wins over the authority
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("b.test"));
        let uri: Uri = "https://a.test/".parse().unwrap();
        assert_eq!(extract_hostname(&headers, &uri).as_deref(), Some("b.test"));
    }

    #[test]
    fn test_inject_notice() {
        let out = inject_notice(b"<html><BODY>x</BODY></html>");
        let text = String::from_utf8(out.to_vec()).unwrap();
        assert!(text.ends_with("</BODY></html>"));
        assert!(text.contains("<script>"));

        let out = inject_notice(b"<p>fragment</p>");
        assert!(String::from_utf8(out.to_vec()).unwrap().starts_with("<p>fragment</p><script>"));
    }

    #[test]
    fn test_https_redirect_location() {
        let response = https_redirect("a.test", "/x?y=1", 443);
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "https://a.test/x?y=1");

        let response = https_redirect("a.test", "/", 8443);
        assert_eq!(response.headers()[header::LOCATION], "https://a.test:8443/");
    }

    #[tokio::test]
    async fn test_static_file_and_directory_index() {
        let root = site_root();
        let handler = handler(SiteConfig::new("a.test", 80, root.path()));

        let response = handler
            .handle(request(Method::GET, "a.test", "/style.css"), &conn())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/css");
        assert_eq!(body_string(response).await, "body{}");

        let response = handler
            .handle(request(Method::GET, "a.test", "/docs/"), &conn())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "<p>docs</p>");
    }

    #[tokio::test]
    async fn test_head_has_length_but_no_body() {
        let root = site_root();
        let handler = handler(SiteConfig::new("a.test", 80, root.path()));

        let response = handler
            .handle(request(Method::HEAD, "a.test", "/style.css"), &conn())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "6");
        assert_eq!(body_string(response).await, "");
    }

    #[tokio::test]
    async fn test_traversal_is_not_served() {
        let outer = tempfile::tempdir().unwrap();
        std::fs::write(outer.path().join("secret.txt"), "secret").unwrap();
        let root = outer.path().join("www");
        std::fs::create_dir_all(&root).unwrap();
        let handler = handler(SiteConfig::new("a.test", 80, &root));

        let response = handler
            .handle(request(Method::GET, "a.test", "/%2e%2e/secret.txt"), &conn())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(!body_string(response).await.contains("secret"));
    }

    #[tokio::test]
    async fn test_spa_fallback_vs_not_found() {
        let root = site_root();
        let handler = handler(
            SiteConfig::new("a.test", 80, root.path()).with_spa_rewrite("/app", "index.html"),
        );

        let response = handler
            .handle(request(Method::GET, "a.test", "/app/settings/profile"), &conn())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("home"));

        let response = handler
            .handle(request(Method::GET, "a.test", "/elsewhere"), &conn())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["x-gateway-error"], "NOT_FOUND");
        assert!(body_string(response).await.contains("<h1>404</h1>"));
    }

    #[tokio::test]
    async fn test_custom_404_page() {
        let root = site_root();
        std::fs::create_dir_all(root.path().join("errors")).unwrap();
        std::fs::write(root.path().join("errors/404.html"), "<h1>lost</h1>").unwrap();
        let handler = handler(SiteConfig::new("a.test", 80, root.path()));

        let response = handler
            .handle(request(Method::GET, "a.test", "/missing"), &conn())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, "<h1>lost</h1>");
    }

    #[tokio::test]
    async fn test_post_to_static_path_is_not_found() {
        let root = site_root();
        let handler = handler(SiteConfig::new("a.test", 80, root.path()));

        let response = handler
            .handle(request(Method::POST, "a.test", "/style.css"), &conn())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_proxy_strips_prefix_and_forwards_headers() {
        let root = site_root();
        let (port, backend_task) = spawn_echo_backend().await;
        let handler = handler(SiteConfig::new("a.test", 80, root.path()).with_backend(backend(port)));

        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/users?page=2")
            .header(header::HOST, "a.test")
            .header(X_FORWARDED_FOR, "6.6.6.6")
            .body(Full::new(Bytes::from("payload")))
            .unwrap();
        let response = handler.handle(req, &conn()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "from-be");

        let head = backend_task.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("post /users?page=2 http/1.1"), "{}", head);
        assert!(head.contains("x-forwarded-for: 192.0.2.10"), "{}", head);
        assert!(!head.contains("6.6.6.6"), "{}", head);
        assert!(head.contains("x-forwarded-host: a.test"), "{}", head);
        assert!(head.contains("x-forwarded-proto: http"), "{}", head);
        assert!(head.contains("x-request-id: "), "{}", head);
    }

    #[tokio::test]
    async fn test_unreachable_backend_marks_site_and_injects_notice() {
        let root = site_root();
        let handler = handler(
            SiteConfig::new("a.test", 80, root.path()).with_backend(backend(closed_port())),
        );

        let response = handler
            .handle(request(Method::GET, "a.test", "/api/status"), &conn())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()["x-gateway-error"], "BACKEND_UNREACHABLE");
        assert!(body_string(response).await.contains("<script>"));
        assert!(handler.backend_unreachable());

        // Static HTML now carries the notice, other types do not
        let response = handler
            .handle(request(Method::GET, "a.test", "/"), &conn())
            .await;
        let body = body_string(response).await;
        assert!(body.contains("home"));
        assert!(body.contains("<script>"));

        let response = handler
            .handle(request(Method::GET, "a.test", "/style.css"), &conn())
            .await;
        assert_eq!(body_string(response).await, "body{}");
    }

    #[tokio::test]
    async fn test_backend_dropping_request_is_not_unreachable() {
        let root = site_root();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Read the request, then hang up without answering
        let _rude = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = stream.read(&mut buf).await;
        });

        let handler = handler(SiteConfig::new("a.test", 80, root.path()).with_backend(backend(port)));
        let response = handler
            .handle(request(Method::GET, "a.test", "/api/status"), &conn())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()["x-gateway-error"], "BACKEND_ERROR");
        assert!(!body_string(response).await.contains("<script>"));
        assert!(!handler.backend_unreachable());
    }

    #[tokio::test]
    async fn test_successful_proxy_clears_unreachable_mark() {
        let root = site_root();
        let (port, _backend_task) = spawn_echo_backend().await;
        let handler = handler(SiteConfig::new("a.test", 80, root.path()).with_backend(backend(port)));
        handler.backend_unreachable.store(true, Ordering::Relaxed);

        let response = handler
            .handle(request(Method::GET, "a.test", "/api"), &conn())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!handler.backend_unreachable());
    }

    #[tokio::test]
    async fn test_backend_timeout_is_504() {
        let root = site_root();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept and never answer
        let _silent = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let handler = SiteHandler::new(
            Arc::new(SiteConfig::new("a.test", 80, root.path()).with_backend(backend(port))),
            Arc::new(ConnectionPool::new(PoolConfig::default())),
            Duration::from_millis(200),
        );
        let response = handler
            .handle(request(Method::GET, "a.test", "/api/slow"), &conn())
            .await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(!handler.backend_unreachable());
    }

    fn registered(registry: &VirtualHostRegistry, key: &str, config: SiteConfig) {
        let config = Arc::new(config);
        let handler = Arc::new(SiteHandler::new(
            Arc::clone(&config),
            Arc::new(ConnectionPool::new(PoolConfig::default())),
            Duration::from_secs(2),
        ));
        let site = Arc::new(Site::new(config, handler));
        site.set_running(true);
        registry.register(key, site);
    }

    fn dispatcher(registry: Arc<VirtualHostRegistry>, cache: &Path) -> HostDispatcher {
        let settings = AcmeSettings {
            enabled: false,
            cache_dir: cache.to_path_buf(),
            ..AcmeSettings::default()
        };
        HostDispatcher::new(registry, Arc::new(CertificateManager::new(settings)), 443)
    }

    #[tokio::test]
    async fn test_dispatcher_routes_by_host() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("index.html"), "site-a").unwrap();
        std::fs::write(b.path().join("index.html"), "site-b").unwrap();
        let cache = tempfile::tempdir().unwrap();

        let registry = Arc::new(VirtualHostRegistry::new());
        registered(&registry, "a.test", SiteConfig::new("a.test", 80, a.path()));
        registered(&registry, "b.test", SiteConfig::new("b.test", 80, b.path()));
        let dispatcher = dispatcher(Arc::clone(&registry), cache.path());

        let response = dispatcher
            .dispatch(request(Method::GET, "a.test", "/"), &conn())
            .await;
        assert_eq!(body_string(response).await, "site-a");

        let response = dispatcher
            .dispatch(request(Method::GET, "B.test:80", "/"), &conn())
            .await;
        assert_eq!(body_string(response).await, "site-b");

        let response = dispatcher
            .dispatch(request(Method::GET, "c.test", "/"), &conn())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["x-gateway-error"], "UNKNOWN_HOST");

        registered(&registry, DEFAULT_SITE, SiteConfig::new("a.test", 80, a.path()));
        let response = dispatcher
            .dispatch(request(Method::GET, "c.test", "/"), &conn())
            .await;
        assert_eq!(body_string(response).await, "site-a");
    }

    #[tokio::test]
    async fn test_dispatcher_routes_http2_by_authority() {
        use crate::server::{ListenerKind, SiteServer};
        use hyper_util::rt::{TokioExecutor, TokioIo};

        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("index.html"), "site-a").unwrap();
        std::fs::write(b.path().join("index.html"), "site-b").unwrap();
        let cache = tempfile::tempdir().unwrap();

        let registry = Arc::new(VirtualHostRegistry::new());
        registered(&registry, "a.test", SiteConfig::new("a.test", 80, a.path()));
        registered(&registry, "b.test", SiteConfig::new("b.test", 80, b.path()));
        let front: Arc<dyn RequestHandler> = Arc::new(dispatcher(registry, cache.path()));
        let server = SiteServer::bind(
            "shared-http",
            "127.0.0.1:0".parse().unwrap(),
            ListenerKind::Shared,
            front,
            None,
            Duration::from_secs(5),
        )
        .unwrap();

        // Prior-knowledge h2: the host travels as :authority only
        let stream = tokio::net::TcpStream::connect(server.local_addr())
            .await
            .unwrap();
        let (mut sender, connection) =
            hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
                .await
                .unwrap();
        let driver = tokio::spawn(connection);

        for (host, expected) in [("a.test", "site-a"), ("b.test", "site-b")] {
            let req = Request::builder()
                .uri(format!("http://{}/", host))
                .body(Empty::<Bytes>::new())
                .unwrap();
            assert!(req.headers().get(header::HOST).is_none());

            let response = sender.send_request(req).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "host {}", host);
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], expected.as_bytes());
        }

        drop(sender);
        driver.abort();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatcher_skips_stopped_site() {
        let root = site_root();
        let cache = tempfile::tempdir().unwrap();
        let registry = Arc::new(VirtualHostRegistry::new());
        registered(&registry, "a.test", SiteConfig::new("a.test", 80, root.path()));
        let dispatcher = dispatcher(Arc::clone(&registry), cache.path());

        registry.get("a.test").unwrap().set_running(false);
        let response = dispatcher
            .dispatch(request(Method::GET, "a.test", "/"), &conn())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["x-gateway-error"], "UNKNOWN_HOST");
    }

    #[tokio::test]
    async fn test_dispatcher_answers_acme_challenge_and_redirects() {
        let root = site_root();
        let cache = tempfile::tempdir().unwrap();
        let (cert, key) = crate::tls::tests::self_signed_pem("localhost");
        std::fs::create_dir_all(cache.path().join("localhost")).unwrap();
        std::fs::write(cache.path().join("localhost/cert.pem"), cert).unwrap();
        std::fs::write(cache.path().join("localhost/key.pem"), key).unwrap();

        let registry = Arc::new(VirtualHostRegistry::new());
        registered(&registry, "localhost", SiteConfig::new("localhost", 80, root.path()));
        let dispatcher = dispatcher(registry, cache.path());
        let entry = dispatcher.certificates.prepare("localhost").await.unwrap();
        entry
            .challenges()
            .set("tok123".to_string(), "tok123.key".to_string());

        let response = dispatcher
            .dispatch(
                request(Method::GET, "localhost", "/.well-known/acme-challenge/tok123"),
                &conn(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "tok123.key");

        let response = dispatcher
            .dispatch(request(Method::GET, "localhost:80", "/page?x=1"), &conn())
            .await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://localhost/page?x=1"
        );

        let tls = ConnInfo {
            is_tls: true,
            ..conn()
        };
        let response = dispatcher
            .dispatch(request(Method::GET, "localhost", "/"), &tls)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_site_listener_follows_registry() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(first.path().join("index.html"), "v1").unwrap();
        std::fs::write(second.path().join("index.html"), "v2").unwrap();

        let registry = Arc::new(VirtualHostRegistry::new());
        let listener = SiteListener::new(Arc::clone(&registry), "a.test");
        registered(&registry, "a.test", SiteConfig::new("a.test", 8080, first.path()));

        let response = listener
            .dispatch(request(Method::GET, "anything", "/"), &conn())
            .await;
        assert_eq!(body_string(response).await, "v1");

        registered(&registry, "a.test", SiteConfig::new("a.test", 8080, second.path()));
        let response = listener
            .dispatch(request(Method::GET, "anything", "/"), &conn())
            .await;
        assert_eq!(body_string(response).await, "v2");

        registry.clear();
        let response = listener
            .dispatch(request(Method::GET, "anything", "/"), &conn())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
