//! Error taxonomy and HTML error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Body type shared by every response the gateway produces
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors surfaced by the serving engine.
///
/// Each variant carries the site (or path) it concerns so operators can act
/// on the message without cross-referencing logs.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A site configuration is missing a field or holds an invalid value
    #[error("invalid configuration for site '{site}': {reason}")]
    Config { site: String, reason: String },

    /// Two enabled sites claim the same host and port
    #[error("site '{server_name}' is declared more than once on port {port}")]
    DuplicateSite { server_name: String, port: u16 },

    /// A file or directory the site depends on could not be accessed
    #[error("cannot access {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TLS material could not be loaded or assembled
    #[error("TLS setup failed for site '{site}': {reason}")]
    Tls { site: String, reason: String },

    /// A listener could not be bound
    #[error("failed to bind {addr} for site '{site}': {source}")]
    Bind {
        site: String,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Hostname resolution failed
    #[error("DNS lookup failed for {host}: {reason}")]
    Dns { host: String, reason: String },

    /// The backend process could not be spawned
    #[error("failed to spawn backend for site '{site}': {source}")]
    Spawn {
        site: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend entry file is empty for site '{0}'")]
    EmptyBackendFile(String),

    #[error("server for site '{0}' is already running")]
    AlreadyRunning(String),

    #[error("server for site '{0}' is not running")]
    NotRunning(String),

    #[error("graceful shutdown of '{site}' did not finish within {timeout:?}")]
    ShutdownTimeout { site: String, timeout: Duration },

    #[error("site '{0}' not found")]
    SiteNotFound(String),

    #[error("site '{0}' is already enabled")]
    AlreadyEnabled(String),

    #[error("site '{0}' is not enabled")]
    NotEnabled(String),
}

impl GatewayError {
    pub(crate) fn config(site: impl Into<String>, reason: impl Into<String>) -> Self {
        GatewayError::Config {
            site: site.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GatewayError::Filesystem {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn tls(site: impl Into<String>, reason: impl Into<String>) -> Self {
        GatewayError::Tls {
            site: site.into(),
            reason: reason.into(),
        }
    }
}

/// Error codes reported in the `X-Gateway-Error` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorCode {
    /// No site matched the request host
    UnknownHost,
    /// Nothing on disk matched the request path
    NotFound,
    /// The backend refused or dropped the connection
    BackendUnreachable,
    /// The backend accepted the connection but the exchange failed
    BackendError,
    /// The backend did not answer in time
    BackendTimeout,
    /// Internal failure while building the response
    InternalError,
}

impl GatewayErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::BackendUnreachable => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::BackendError => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::UnknownHost => "UNKNOWN_HOST",
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::BackendUnreachable => "BACKEND_UNREACHABLE",
            GatewayErrorCode::BackendError => "BACKEND_ERROR",
            GatewayErrorCode::BackendTimeout => "BACKEND_TIMEOUT",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Script appended to pages while a site's backend cannot be reached.
/// It warns the visitor without blocking the page.
pub const BACKEND_NOTICE: &str = r#"<script>
window.addEventListener("load", function () {
  console.warn("sitegate: backend unreachable, some features may be unavailable");
  var n = document.createElement("div");
  n.setAttribute("role", "alert");
  n.style.cssText = "position:fixed;bottom:1rem;right:1rem;padding:.75rem 1rem;background:#b45309;color:#fff;font:14px sans-serif;border-radius:.375rem;z-index:2147483647";
  n.textContent = "Backend unavailable: some features may not work.";
  document.body.appendChild(n);
  setTimeout(function () { n.remove(); }, 8000);
});
</script>
"#;

/// Render the built-in themed error page for a status code
pub fn default_error_page(status: StatusCode) -> String {
    let code = status.as_u16();
    let reason = status.canonical_reason().unwrap_or("Unknown Error");
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>{code} {reason}</title>
<style>
:root {{ --bg: #ffffff; --fg: #0f172a; --muted: #64748b; --card: #f8fafc; --border: #e2e8f0; }}
@media (prefers-color-scheme: dark) {{
  :root {{ --bg: #020617; --fg: #f8fafc; --muted: #94a3b8; --card: #0f172a; --border: #1e293b; }}
}}
body {{ margin: 0; min-height: 100vh; display: flex; align-items: center; justify-content: center;
  background: var(--bg); color: var(--fg); font-family: -apple-system, "Segoe UI", Roboto, sans-serif; }}
main {{ text-align: center; padding: 2.5rem 3rem; background: var(--card); border: 1px solid var(--border); border-radius: .75rem; }}
h1 {{ font-size: 4rem; margin: 0; letter-spacing: -.05em; }}
p {{ color: var(--muted); margin: .5rem 0 0; }}
</style>
</head>
<body>
<main>
<h1>{code}</h1>
<p>{reason}</p>
</main>
</body>
</html>
"#
    )
}

pub(crate) fn full_body(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// Build an HTML response from a status and an already rendered body
pub fn html_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Built-in error page tagged with an `X-Gateway-Error` header
pub fn error_page_response(code: GatewayErrorCode) -> Response<ResponseBody> {
    let status = code.status_code();
    let mut response = html_response(status, default_error_page(status));
    response.headers_mut().insert(
        "x-gateway-error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}
