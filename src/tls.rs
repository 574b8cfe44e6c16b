//! Certificate loading and rustls server configuration

use crate::error::{GatewayError, Result};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn with_alpn(mut config: ServerConfig) -> ServerConfig {
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    config
}

/// Read every certificate of a PEM file
pub fn load_certs(site: &str, path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| GatewayError::fs(path, e))?;
    let certs = parse_certs(&mut BufReader::new(file)).map_err(|e| {
        GatewayError::tls(
            site,
            format!("failed to parse certificates from {}: {}", path.display(), e),
        )
    })?;

    if certs.is_empty() {
        return Err(GatewayError::tls(
            site,
            format!("no certificates found in {}", path.display()),
        ));
    }
    Ok(certs)
}

/// Read the first private key of a PEM file (PKCS#1, PKCS#8 or SEC1)
pub fn load_key(site: &str, path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| GatewayError::fs(path, e))?;
    match parse_key(&mut BufReader::new(file)) {
        Ok(Some(key)) => Ok(key),
        Ok(None) => Err(GatewayError::tls(
            site,
            format!("no private key found in {}", path.display()),
        )),
        Err(e) => Err(GatewayError::tls(
            site,
            format!("failed to parse key from {}: {}", path.display(), e),
        )),
    }
}

pub(crate) fn parse_certs(
    reader: &mut dyn std::io::BufRead,
) -> std::io::Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(reader).collect()
}

pub(crate) fn parse_key(
    reader: &mut dyn std::io::BufRead,
) -> std::io::Result<Option<PrivateKeyDer<'static>>> {
    loop {
        match rustls_pemfile::read_one(reader)? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(Some(key.into())),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(Some(key.into())),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(Some(key.into())),
            None => return Ok(None),
            _ => continue,
        }
    }
}

/// Pair a chain with its signing key
pub fn certified_key(
    certs: Vec<CertificateDer<'static>>,
    key: &PrivateKeyDer<'static>,
) -> std::result::Result<Arc<CertifiedKey>, rustls::Error> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(key)?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Acceptor for a site with its own certificate files.
///
/// Both files are read and checked here so a bad certificate fails the
/// site before any socket is bound.
pub fn manual_acceptor(site: &str, cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(site, cert_path)?;
    let key = load_key(site, key_path)?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| GatewayError::tls(site, e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| GatewayError::tls(site, format!("TLS configuration error: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(with_alpn(config))))
}

/// Acceptor that picks the certificate per connection
pub fn resolver_acceptor(resolver: Arc<dyn ResolvesServerCert>) -> Result<TlsAcceptor> {
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| GatewayError::tls("*", e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    Ok(TlsAcceptor::from(Arc::new(with_alpn(config))))
}
