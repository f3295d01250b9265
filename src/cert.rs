//! TLS credential store
//!
//! Loads the certificate/key pair used by the proxy inbound and builds
//! per-transport acceptors from it.

use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_rustls::TlsAcceptor;

use crate::config::CertConfig;
use crate::error::{NodeError, Result};
use crate::logger::log;

/// Certificate resolver whose key pair can be swapped while acceptors built
/// from it keep running
#[derive(Debug)]
struct SwappableCert {
    current: RwLock<Arc<CertifiedKey>>,
}

impl SwappableCert {
    fn get(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn set(&self, key: Arc<CertifiedKey>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = key;
    }
}

impl ResolvesServerCert for SwappableCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.get())
    }
}

/// Holds the TLS server configuration; the certificate is reloadable on
/// demand and reloads reach acceptors that are already serving.
pub struct CertStore {
    config: CertConfig,
    provider: Arc<CryptoProvider>,
    cert: Arc<SwappableCert>,
    server_config: Arc<ServerConfig>,
}

impl std::fmt::Debug for CertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CertStore {
    /// Load certificate and key from the configured paths
    pub fn load(config: &CertConfig) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let key = load_certified_key(&provider, &config.cert_file, &config.key_file)?;
        let cert = Arc::new(SwappableCert {
            current: RwLock::new(key),
        });

        let mut server_config = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| NodeError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_cert_resolver(cert.clone());

        // Session tickets let reconnecting clients skip the full handshake
        if let Ok(ticketer) = rustls::crypto::ring::Ticketer::new() {
            server_config.ticketer = ticketer;
        }

        log::info!(
            cert = %config.cert_file.display(),
            key = %config.key_file.display(),
            "TLS certificates loaded"
        );
        Ok(Self {
            config: config.clone(),
            provider,
            cert,
            server_config: Arc::new(server_config),
        })
    }

    /// Re-read certificate and key from disk.
    ///
    /// On failure the previously loaded pair stays in use. On success new
    /// handshakes, including those on running acceptors, present the new pair.
    pub fn reload(&self) -> Result<()> {
        let fresh = load_certified_key(&self.provider, &self.config.cert_file, &self.config.key_file)?;
        self.cert.set(fresh);
        log::info!(cert = %self.config.cert_file.display(), "TLS certificates reloaded");
        Ok(())
    }

    pub fn cert_config(&self) -> &CertConfig {
        &self.config
    }

    /// Server configuration without ALPN
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }

    /// Certificate chain and key currently presented
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.cert.get()
    }

    /// Build an acceptor advertising the given ALPN protocols
    pub fn acceptor(&self, alpn: &[&[u8]]) -> TlsAcceptor {
        let mut config = (*self.server_config).clone();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        TlsAcceptor::from(Arc::new(config))
    }
}

fn load_certified_key(
    provider: &CryptoProvider,
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<CertifiedKey>> {
    let cert_file = File::open(cert_path).map_err(|e| {
        NodeError::Tls(format!(
            "failed to open certificate {}: {}",
            cert_path.display(),
            e
        ))
    })?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_reader)
        .filter_map(|r| r.ok())
        .collect();

    if certs.is_empty() {
        return Err(NodeError::Tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key_file = File::open(key_path).map_err(|e| {
        NodeError::Tls(format!(
            "failed to open private key {}: {}",
            key_path.display(),
            e
        ))
    })?;
    let mut key_reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| NodeError::Tls(format!("failed to read private key: {}", e)))?
        .ok_or_else(|| {
            NodeError::Tls(format!("no private key found in {}", key_path.display()))
        })?;

    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|e| NodeError::Tls(format!("unsupported private key: {}", e)))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}
