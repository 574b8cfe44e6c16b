//! End-to-end tests: real sockets, real site directories, `sh` backends
#![cfg(unix)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sitegate::config::{AcmeSettings, BackendSettings, GatewayConfig};
use sitegate::error::GatewayError;
use sitegate::lifecycle::{Placement, ServerManager};
use sitegate::process::BackendSupervisor;
use sitegate::site::{BackendConfig, BackendKind};
use sitegate::topology::{SiteDirectory, SiteSource};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// ============================================================================
// Test Helpers
// ============================================================================

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send HTTP request with custom Host header
async fn http_get_with_host(
    port: u16,
    path: &str,
    host: &str,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

struct Gateway {
    base: TempDir,
    sites: SiteDirectory,
    manager: Arc<ServerManager>,
}

impl Gateway {
    fn new() -> Self {
        let base = TempDir::new().unwrap();
        let sites = SiteDirectory::new(
            base.path().join("sites-available"),
            base.path().join("sites-enabled"),
        );
        sites.ensure_layout().unwrap();

        let mut config = GatewayConfig::default();
        config.paths.base_dir = base.path().to_path_buf();
        config.server.bind = "127.0.0.1".to_string();
        config.server.http_port = free_port();
        config.server.https_port = free_port();
        config.server.shutdown_timeout_secs = 2;
        config.server.request_timeout_secs = 5;
        config.acme = AcmeSettings {
            enabled: false,
            cache_dir: base.path().join("certs-cache"),
            ..AcmeSettings::default()
        };
        config.backends.node_command = "sh".to_string();

        let source: Arc<dyn SiteSource> = Arc::new(sites.clone());
        let manager = Arc::new(ServerManager::new(config, source));
        Self {
            base,
            sites,
            manager,
        }
    }

    fn http_port(&self) -> u16 {
        self.manager.config().server.http_port
    }

    /// Write `<name>/<name>.conf` plus a `www/index.html` holding `body`
    fn add_site(&self, name: &str, listen: u16, body: &str, extra: &str) -> PathBuf {
        let dir = self.sites.site_dir(name);
        let www = dir.join("www");
        std::fs::create_dir_all(&www).unwrap();
        std::fs::write(www.join("index.html"), body).unwrap();
        let conf = format!(
            "server_name {}\nlisten {}\nroot {}\n{}",
            name,
            listen,
            www.display(),
            extra
        );
        std::fs::write(self.sites.conf_path(name), conf).unwrap();
        www
    }

    fn enable(&self, name: &str) {
        self.sites.enable(name).unwrap();
    }

    /// `sh` script that stays alive until killed
    fn idle_backend(&self, name: &str) -> PathBuf {
        let dir = self.base.path().join(format!("{}-backend", name));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("main.sh"), "echo started\nwhile true; do sleep 1; done\n").unwrap();
        dir
    }
}

/// In-process HTTP backend answering every request with `body` after `delay`
async fn spawn_http_backend(body: &'static str, delay: Duration) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let _ = stream.read(&mut buf).await;
                tokio::time::sleep(delay).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    port
}

fn backend_config(dir: &Path, entry: &str, port: u16) -> BackendConfig {
    BackendConfig {
        route: "/api".to_string(),
        kind: BackendKind::Node,
        dir: dir.to_path_buf(),
        entry_file: entry.to_string(),
        internal_port: port,
    }
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_shared_listener_isolates_hosts() {
    let gw = Gateway::new();
    let port = gw.http_port();
    gw.add_site("a.test", port, "content-a", "");
    gw.add_site("b.test", port, "content-b", "");
    gw.enable("a.test");
    gw.enable("b.test");

    let report = gw.manager.start_all().await;
    assert_eq!(report.running, vec!["a.test", "b.test"]);
    assert_eq!(gw.manager.placement("a.test"), Some(Placement::SharedHttp));
    assert!(wait_for_port(port, Duration::from_secs(2)).await);

    let response = http_get_with_host(port, "/", "a.test").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("content-a"), "{}", response);
    assert!(!response.contains("content-b"));

    let response = http_get_with_host(port, "/", "B.TEST:80").await.unwrap();
    assert!(response.ends_with("content-b"), "{}", response);

    let response = http_get_with_host(port, "/", "unknown.test").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "{}", response);
    assert!(response.to_ascii_lowercase().contains("x-gateway-error: unknown_host"));

    gw.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_spa_fallback_and_not_found() {
    let gw = Gateway::new();
    let port = free_port();
    gw.add_site("spa.test", port, "<html><body>app shell</body></html>", "spa_rewrite /app index.html\n");
    gw.enable("spa.test");
    gw.manager.start_all().await;
    assert!(wait_for_port(port, Duration::from_secs(2)).await);

    let response = http_get_with_host(port, "/app/users/42", "spa.test").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("app shell"));

    let response = http_get_with_host(port, "/other/page", "spa.test").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "{}", response);
    assert!(response.contains("<h1>404</h1>"));

    gw.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_backend_route_is_proxied() {
    let gw = Gateway::new();
    let port = free_port();
    let backend_port = spawn_http_backend("pong", Duration::ZERO).await;
    let backend_dir = gw.idle_backend("api.test");
    gw.add_site(
        "api.test",
        port,
        "static",
        &format!(
            "backend /api {}\nbackend_file main.sh\nbackend_internal_port {}\n",
            backend_dir.display(),
            backend_port
        ),
    );
    gw.enable("api.test");
    gw.manager.start_all().await;
    assert!(wait_for_port(port, Duration::from_secs(2)).await);
    assert!(gw.manager.backends().is_running("api.test"));

    let response = http_get_with_host(port, "/api/ping", "api.test").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("pong"), "{}", response);

    let response = http_get_with_host(port, "/", "api.test").await.unwrap();
    assert!(response.ends_with("static"), "{}", response);

    gw.manager.shutdown().await.unwrap();
    assert!(!gw.manager.backends().is_running("api.test"));
}

#[tokio::test]
async fn test_unreachable_backend_notice() {
    let gw = Gateway::new();
    let port = free_port();
    let backend_dir = gw.idle_backend("down.test");
    gw.add_site(
        "down.test",
        port,
        "<html><body>home</body></html>",
        &format!(
            "backend /api {}\nbackend_file main.sh\nbackend_internal_port {}\n",
            backend_dir.display(),
            free_port()
        ),
    );
    gw.enable("down.test");
    gw.manager.start_all().await;
    assert!(wait_for_port(port, Duration::from_secs(2)).await);

    let response = http_get_with_host(port, "/api/data", "down.test").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 502"), "{}", response);
    assert!(response.contains("<script>"));

    let response = http_get_with_host(port, "/", "down.test").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("home"));
    assert!(response.contains("<script>"));

    gw.manager.shutdown().await.unwrap();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_start_twice_then_stop_and_start() {
    let gw = Gateway::new();
    let port = free_port();
    gw.add_site("twice.test", port, "hello", "");
    gw.enable("twice.test");
    gw.manager.start_all().await;
    assert!(gw.manager.is_running("twice.test"));

    let err = gw.manager.start_server("twice.test").await.unwrap_err();
    assert!(matches!(err, GatewayError::AlreadyRunning(_)));

    gw.manager.stop_server("twice.test").await.unwrap();
    assert!(!gw.manager.is_running("twice.test"));
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

    gw.manager.start_server("twice.test").await.unwrap();
    let response = http_get_with_host(port, "/", "twice.test").await.unwrap();
    assert!(response.ends_with("hello"), "{}", response);

    gw.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_graceful_stop_finishes_in_flight_request() {
    let gw = Gateway::new();
    let port = free_port();
    let backend_port = spawn_http_backend("slow-done", Duration::from_millis(500)).await;
    let backend_dir = gw.idle_backend("slow.test");
    gw.add_site(
        "slow.test",
        port,
        "static",
        &format!(
            "backend /api {}\nbackend_file main.sh\nbackend_internal_port {}\n",
            backend_dir.display(),
            backend_port
        ),
    );
    gw.enable("slow.test");
    gw.manager.start_all().await;
    assert!(wait_for_port(port, Duration::from_secs(2)).await);

    let request = tokio::spawn(async move { http_get_with_host(port, "/api/slow", "slow.test").await });
    tokio::time::sleep(Duration::from_millis(150)).await;

    gw.manager.stop_server("slow.test").await.unwrap();
    let response = request.await.unwrap().unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("slow-done"), "{}", response);

    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn test_manual_tls_missing_cert_keeps_others_running() {
    let gw = Gateway::new();
    let good_port = free_port();
    let bad_port = free_port();
    gw.add_site("good.test", good_port, "fine", "");
    gw.add_site(
        "secure.test",
        bad_port,
        "secret",
        "ssl_enabled true\nssl_cert_file /nonexistent/cert.pem\nssl_key_file /nonexistent/key.pem\n",
    );
    gw.enable("good.test");
    gw.enable("secure.test");

    let report = gw.manager.start_all().await;
    assert_eq!(report.running, vec!["good.test"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "secure.test");

    assert!(!gw.manager.is_running("secure.test"));
    assert!(TcpStream::connect(("127.0.0.1", bad_port)).await.is_err());

    let response = http_get_with_host(good_port, "/", "good.test").await.unwrap();
    assert!(response.ends_with("fine"), "{}", response);

    gw.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_manual_tls_site_gets_dedicated_listener() {
    let gw = Gateway::new();
    let port = free_port();
    let cert = rcgen::generate_simple_self_signed(vec!["secure.test".to_string()]).unwrap();
    let tls_dir = gw.base.path().join("tls");
    std::fs::create_dir_all(&tls_dir).unwrap();
    std::fs::write(tls_dir.join("cert.pem"), cert.cert.pem()).unwrap();
    std::fs::write(tls_dir.join("key.pem"), cert.key_pair.serialize_pem()).unwrap();

    gw.add_site(
        "secure.test",
        port,
        "secret",
        &format!(
            "ssl_enabled true\nssl_cert_file {}\nssl_key_file {}\n",
            tls_dir.join("cert.pem").display(),
            tls_dir.join("key.pem").display()
        ),
    );
    gw.enable("secure.test");
    gw.manager.start_all().await;

    assert_eq!(gw.manager.placement("secure.test"), Some(Placement::DedicatedTls));
    let addr: SocketAddr = gw.manager.local_addr("secure.test").unwrap();
    assert_eq!(addr.port(), port);
    assert!(wait_for_port(port, Duration::from_secs(2)).await);

    gw.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reload_swaps_handlers_and_drops_disabled_sites() {
    let gw = Gateway::new();
    let keep_port = free_port();
    let drop_port = free_port();
    gw.add_site("keep.test", keep_port, "version-1", "");
    gw.add_site("drop.test", drop_port, "going", "");
    gw.enable("keep.test");
    gw.enable("drop.test");
    gw.manager.start_all().await;
    assert!(wait_for_port(drop_port, Duration::from_secs(2)).await);

    // New content root for the kept site, same port
    let new_root = gw.sites.site_dir("keep.test").join("www2");
    std::fs::create_dir_all(&new_root).unwrap();
    std::fs::write(new_root.join("index.html"), "version-2").unwrap();
    std::fs::write(
        gw.sites.conf_path("keep.test"),
        format!(
            "server_name keep.test\nlisten {}\nroot {}\n",
            keep_port,
            new_root.display()
        ),
    )
    .unwrap();
    gw.sites.disable("drop.test").unwrap();

    let report = gw.manager.reload().await;
    assert_eq!(report.running, vec!["keep.test"]);

    let response = http_get_with_host(keep_port, "/", "keep.test").await.unwrap();
    assert!(response.ends_with("version-2"), "{}", response);

    assert!(!gw.manager.is_running("drop.test"));
    assert!(gw.manager.registry().get("drop.test").is_none());
    assert!(TcpStream::connect(("127.0.0.1", drop_port)).await.is_err());

    gw.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_unbinds_everything() {
    let gw = Gateway::new();
    let shared = gw.http_port();
    let dedicated = free_port();
    gw.add_site("one.test", shared, "one", "");
    gw.add_site("two.test", dedicated, "two", "");
    gw.enable("one.test");
    gw.enable("two.test");
    gw.manager.start_all().await;
    assert!(wait_for_port(shared, Duration::from_secs(2)).await);
    assert!(wait_for_port(dedicated, Duration::from_secs(2)).await);

    gw.manager.shutdown().await.unwrap();
    assert!(gw.manager.running_sites().is_empty());
    assert!(TcpStream::connect(("127.0.0.1", shared)).await.is_err());
    assert!(TcpStream::connect(("127.0.0.1", dedicated)).await.is_err());
}

// ============================================================================
// Backend supervision
// ============================================================================

fn supervisor() -> Arc<BackendSupervisor> {
    BackendSupervisor::new(BackendSettings {
        node_command: "sh".to_string(),
        ..BackendSettings::default()
    })
}

#[tokio::test]
async fn test_launch_twice_runs_one_process() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("main.sh"), "while true; do sleep 1; done\n").unwrap();
    let backend = backend_config(dir.path(), "main.sh", free_port());
    let supervisor = supervisor();

    supervisor.launch("site.test", &backend).unwrap();
    let pid = supervisor.pid("site.test");
    supervisor.launch("site.test", &backend).unwrap();

    assert!(pid.is_some());
    assert_eq!(supervisor.pid("site.test"), pid);
    assert_eq!(supervisor.active_backends(), vec!["site.test"]);

    supervisor.stop("site.test").await;
    assert!(!supervisor.is_running("site.test"));
    assert!(supervisor.log_channel("site.test").is_none());
}

#[tokio::test]
async fn test_log_channel_closes_when_backend_exits() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("main.sh"), "echo one\necho two >&2\nexit 3\n").unwrap();
    let backend = backend_config(dir.path(), "main.sh", free_port());
    let supervisor = supervisor();

    supervisor.launch("exit.test", &backend).unwrap();
    let channel = supervisor.log_channel("exit.test").unwrap();

    let mut lines = Vec::new();
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(line) = channel.recv().await {
            lines.push(line);
        }
    })
    .await;

    assert!(drained.is_ok(), "channel never closed");
    lines.sort();
    assert_eq!(lines, vec!["one", "two"]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!supervisor.is_running("exit.test"));
    assert!(supervisor.log_channel("exit.test").is_none());
}

#[tokio::test]
async fn test_empty_backend_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let backend = backend_config(dir.path(), "", free_port());

    let err = supervisor().launch("empty.test", &backend).unwrap_err();
    assert!(matches!(err, GatewayError::EmptyBackendFile(_)));
}
