//! Sitegate - a multi-site HTTP/HTTPS gateway
//!
//! This library provides a virtual-host serving engine that:
//! - Serves static sites selected by the `Host` header
//! - Falls back to a single-page-app entry file under a path prefix
//! - Reverse-proxies a route prefix to a per-site backend process
//! - Terminates TLS with certificate files or ACME-issued certificates
//! - Supervises backend processes and streams their output
//! - Starts, stops and hot-reloads per-site listeners

pub mod acme;
pub mod cli;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod process;
pub mod registry;
pub mod router;
pub mod server;
pub mod site;
pub mod tls;
pub mod topology;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
