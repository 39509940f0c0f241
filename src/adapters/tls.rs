//! TLS credential rotation.
//!
//! [`CertificateRotator`] owns the active certificate chain and signing key behind an
//! [`ArcSwap`]. The rustls handshake path resolves through it without locking; a background
//! loop re-reads the PEM files on a fixed interval. Once the initial load succeeds the slot
//! is never empty: a failed periodic reload is logged and the previous certificate stays
//! in effect.
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use arc_swap::ArcSwap;
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_rustls::TlsAcceptor;

use crate::{
    config::TlsConfig,
    core::lifetime::Lifetime,
    metrics::{self, ReloadOutcome},
};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("unsupported private key in {path}: {source}")]
    UnsupportedKey {
        path: PathBuf,
        #[source]
        source: rustls::Error,
    },
    #[error("failed to build TLS server config: {0}")]
    ServerConfig(#[from] rustls::Error),
}

#[derive(Debug)]
pub struct CertificateRotator {
    cert_file: PathBuf,
    key_file: PathBuf,
    interval: Duration,
    current: ArcSwap<CertifiedKey>,
}

impl CertificateRotator {
    /// Load the certificate pair once. Failure is fatal for startup.
    pub fn new(config: &TlsConfig) -> Result<Self, CredentialError> {
        let cert_file = PathBuf::from(&config.cert_file);
        let key_file = PathBuf::from(&config.key_file);
        let initial = load_certified_key(&cert_file, &key_file)?;

        tracing::info!(
            cert_file = %cert_file.display(),
            key_file = %key_file.display(),
            reload_interval = %humantime::format_duration(config.reload_interval),
            "loaded tls cert"
        );

        Ok(Self {
            cert_file,
            key_file,
            interval: config.reload_interval,
            current: ArcSwap::from_pointee(initial),
        })
    }

    pub fn current(&self) -> Arc<CertifiedKey> {
        self.current.load_full()
    }

    /// Re-read the files and swap on success. The active certificate is untouched on error.
    pub fn reload(&self) -> Result<(), CredentialError> {
        let next = load_certified_key(&self.cert_file, &self.key_file)?;
        self.current.store(Arc::new(next));
        Ok(())
    }

    /// Reload every interval until `lifetime` is cancelled.
    pub async fn reload_loop(self: Arc<Self>, lifetime: Lifetime) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = lifetime.cancelled() => break,
                _ = ticker.tick() => {
                    let rotator = self.clone();
                    let outcome = tokio::task::spawn_blocking(move || rotator.reload()).await;
                    match outcome {
                        Ok(Ok(())) => {
                            metrics::increment_certificate_reloads(ReloadOutcome::Success);
                            tracing::info!(cert_file = %self.cert_file.display(), "reloaded tls cert");
                        }
                        Ok(Err(error)) => {
                            metrics::increment_certificate_reloads(ReloadOutcome::Failure);
                            tracing::error!(%error, "reload tls cert");
                        }
                        Err(error) => {
                            metrics::increment_certificate_reloads(ReloadOutcome::Failure);
                            tracing::error!(%error, "reload tls cert task failed");
                        }
                    }
                }
            }
        }

        tracing::debug!("tls reload loop stopped");
    }

    /// rustls acceptor resolving every handshake through this rotator.
    pub fn acceptor(self: &Arc<Self>) -> Result<TlsAcceptor, CredentialError> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(self.clone());
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

impl ResolvesServerCert for CertificateRotator {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current())
    }
}

fn open(path: &Path) -> Result<BufReader<File>, CredentialError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CredentialError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certified_key(
    cert_file: &Path,
    key_file: &Path,
) -> Result<CertifiedKey, CredentialError> {
    let certs = rustls_pemfile::certs(&mut open(cert_file)?)
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(|source| CredentialError::Read {
            path: cert_file.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(CredentialError::NoCertificates(cert_file.to_path_buf()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut open(key_file)?)
        .map_err(|source| CredentialError::Read {
            path: key_file.to_path_buf(),
            source,
        })?
        .ok_or_else(|| CredentialError::NoPrivateKey(key_file.to_path_buf()))?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key).map_err(
        |source| CredentialError::UnsupportedKey {
            path: key_file.to_path_buf(),
            source,
        },
    )?;

    Ok(CertifiedKey::new(certs, signing_key))
}
