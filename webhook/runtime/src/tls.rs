//! Loads the server's TLS material.
//!
//! Certificates and keys are read once, at startup, from PEM files. Rotating
//! them requires a restart.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio_rustls::rustls::{
    self,
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("--tls-cert-file must be set")]
    MissingCert,

    #[error("--tls-key-file must be set")]
    MissingKey,

    #[error("failed to read certificates from {}: {error:?}", path.display())]
    Certs {
        path: PathBuf,
        error: rustls::pki_types::pem::Error,
    },

    #[error("no certificates found in {}", .0.display())]
    NoCerts(PathBuf),

    #[error("failed to read private key from {}: {error:?}", path.display())]
    Key {
        path: PathBuf,
        error: rustls::pki_types::pem::Error,
    },

    #[error("invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),
}

/// Builds a server configuration from a PEM certificate chain and private key.
///
/// Both HTTP/2 and HTTP/1.1 are advertised over ALPN.
pub fn load(
    cert: Option<&Path>,
    key: Option<&Path>,
) -> Result<Arc<rustls::ServerConfig>, Error> {
    let cert = cert.ok_or(Error::MissingCert)?;
    let key = key.ok_or(Error::MissingKey)?;

    let certs = read_certs(cert)?;
    let key = PrivateKeyDer::from_pem_file(key).map_err(|error| Error::Key {
        path: key.to_path_buf(),
        error,
    })?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
        .map_err(|error| Error::Certs {
            path: path.to_path_buf(),
            error,
        })?;
    if certs.is_empty() {
        return Err(Error::NoCerts(path.to_path_buf()));
    }
    Ok(certs)
}
