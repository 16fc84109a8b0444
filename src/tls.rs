//! TLS termination at the ingress
//!
//! Loads a certificate chain and private key from PEM files into a
//! rustls server configuration. Upstream connections are always plain
//! HTTP; TLS exists only between clients and the balancer.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rustls::ServerConfig;
use rustls_pki_types::CertificateDer;
use tokio_rustls::TlsAcceptor;

pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let cert_file = File::open(cert_path)
        .with_context(|| format!("cannot open certificate file {}", cert_path.display()))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("cannot parse certificates in {}", cert_path.display()))?;

    if certs.is_empty() {
        bail!("no certificates found in {}", cert_path.display());
    }

    let key_file = File::open(key_path)
        .with_context(|| format!("cannot open private key file {}", key_path.display()))?;
    let mut key_reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("cannot parse private key in {}", key_path.display()))?
        .with_context(|| format!("no private key found in {}", key_path.display()))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("certificate and key do not form a valid TLS identity")?;

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

pub fn acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(load_tls_config(cert_path, key_path)?))
}
