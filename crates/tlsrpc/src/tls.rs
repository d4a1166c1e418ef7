//! Certificate material loading.
//!
//! [`CertPaths`] names the PEM files for one peer: a CA certificate used to
//! verify the other side, plus this peer's own certificate and private key.
//! Everything here is a setup-time concern; a failure to read or parse any
//! file is fatal before traffic flows, never a dispatch-time error.

use crate::error::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Locations of the certificate and key files for one peer.
#[derive(Debug, Clone)]
pub struct CertPaths {
    /// CA certificate used as the trust root for verifying the other side.
    pub ca_cert: PathBuf,
    /// This peer's certificate.
    pub cert: PathBuf,
    /// This peer's private key.
    pub key: PathBuf,
}

impl CertPaths {
    pub fn new(
        ca_cert: impl Into<PathBuf>,
        cert: impl Into<PathBuf>,
        key: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ca_cert: ca_cert.into(),
            cert: cert.into(),
            key: key.into(),
        }
    }

    fn read(path: &Path) -> Result<Vec<u8>> {
        std::fs::read(path).map_err(|e| Error::Certificate {
            message: format!("failed to read {}", path.display()),
            source: Some(e),
        })
    }

    /// Build a trust-root set from the CA certificate file.
    pub fn root_store(&self) -> Result<RootCertStore> {
        let data = Self::read(&self.ca_cert)?;
        let mut store = RootCertStore::empty();
        let mut added = 0usize;
        for cert in rustls_pemfile::certs(&mut data.as_slice()) {
            let cert = cert.map_err(|e| Error::Certificate {
                message: format!("failed to parse {}", self.ca_cert.display()),
                source: Some(e),
            })?;
            store.add(cert).map_err(|e| Error::Certificate {
                message: format!(
                    "rejected CA certificate from {}: {}",
                    self.ca_cert.display(),
                    e
                ),
                source: None,
            })?;
            added += 1;
        }
        if added == 0 {
            return Err(Error::Certificate {
                message: format!("no CA certificate found in {}", self.ca_cert.display()),
                source: None,
            });
        }
        Ok(store)
    }

    /// Load this peer's certificate chain.
    pub fn cert_chain(&self) -> Result<Vec<CertificateDer<'static>>> {
        let data = Self::read(&self.cert)?;
        let chain: Vec<_> = rustls_pemfile::certs(&mut data.as_slice())
            .collect::<std::io::Result<_>>()
            .map_err(|e| Error::Certificate {
                message: format!("failed to parse {}", self.cert.display()),
                source: Some(e),
            })?;
        if chain.is_empty() {
            return Err(Error::Certificate {
                message: format!("no certificate found in {}", self.cert.display()),
                source: None,
            });
        }
        Ok(chain)
    }

    /// Load this peer's private key.
    pub fn private_key(&self) -> Result<PrivateKeyDer<'static>> {
        let data = Self::read(&self.key)?;
        rustls_pemfile::private_key(&mut data.as_slice())
            .map_err(|e| Error::Certificate {
                message: format!("failed to parse {}", self.key.display()),
                source: Some(e),
            })?
            .ok_or_else(|| Error::Certificate {
                message: format!("no private key found in {}", self.key.display()),
                source: None,
            })
    }

    /// Build a server-side TLS configuration that requires and verifies a
    /// client certificate against the CA.
    pub fn server_config(&self) -> Result<ServerConfig> {
        // rustls resolves its crypto provider process-wide; the reqwest side
        // of this crate may link a second provider, so pin one explicitly.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let roots = self.root_store()?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| Error::Certificate {
                message: format!("failed to build client certificate verifier: {}", e),
                source: None,
            })?;
        ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.cert_chain()?, self.private_key()?)
            .map_err(|e| Error::Certificate {
                message: format!("invalid server certificate or key: {}", e),
                source: None,
            })
    }

    /// This peer's certificate + key as a client identity for outbound calls.
    pub fn client_identity(&self) -> Result<reqwest::Identity> {
        let mut pem = Self::read(&self.key)?;
        pem.extend_from_slice(&Self::read(&self.cert)?);
        reqwest::Identity::from_pem(&pem).map_err(|e| Error::Certificate {
            message: format!(
                "failed to load client identity from {} and {}: {}",
                self.cert.display(),
                self.key.display(),
                e
            ),
            source: None,
        })
    }

    /// The CA certificate as a trust root for outbound calls.
    pub fn ca_certificate(&self) -> Result<reqwest::Certificate> {
        reqwest::Certificate::from_pem(&Self::read(&self.ca_cert)?).map_err(|e| {
            Error::Certificate {
                message: format!("failed to parse {}: {}", self.ca_cert.display(), e),
                source: None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn paths_in(dir: &TempDir) -> CertPaths {
        CertPaths::new(
            dir.path().join("ca.pem"),
            dir.path().join("cert.pem"),
            dir.path().join("key.pem"),
        )
    }

    #[test]
    fn test_missing_files_are_setup_errors() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);

        assert!(matches!(paths.root_store(), Err(Error::Certificate { .. })));
        assert!(matches!(paths.cert_chain(), Err(Error::Certificate { .. })));
        assert!(matches!(paths.private_key(), Err(Error::Certificate { .. })));
        assert!(matches!(paths.server_config(), Err(Error::Certificate { .. })));
    }

    #[test]
    fn test_garbage_pem_is_rejected() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        for path in [&paths.ca_cert, &paths.cert, &paths.key] {
            let mut f = std::fs::File::create(path).unwrap();
            f.write_all(b"this is not pem").unwrap();
        }

        // No parseable blocks in any of the files
        assert!(paths.root_store().is_err());
        assert!(paths.cert_chain().is_err());
        assert!(paths.private_key().is_err());
    }
}
