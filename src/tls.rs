//! mTLS certificate loading.
//!
//! The server presents its own identity and requires every client to
//! present a certificate signed by the configured CA. Authorization on
//! top of the authenticated identity lives in [`crate::grpc::auth`].

use std::path::PathBuf;

use tokio::fs;
use tonic::transport::{Certificate, Identity, ServerTlsConfig};

use crate::config::TlsConfig;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS enabled but {0} is not configured")]
    Incomplete(&'static str),

    #[error("TLS file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to read TLS file: {0}")]
    Io(#[from] std::io::Error),
}

/// Server-side TLS material: our identity plus the CA that client
/// certificates must chain to.
#[derive(Clone, Debug)]
pub struct ServerTls {
    identity: Identity,
    client_ca: Certificate,
}

impl ServerTls {
    /// Load certificate material from the paths in `config`.
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let ca_path = config
            .ca_cert_path
            .as_ref()
            .ok_or(TlsError::Incomplete("ca_cert_path"))?;
        let cert_path = config
            .cert_path
            .as_ref()
            .ok_or(TlsError::Incomplete("cert_path"))?;
        let key_path = config
            .key_path
            .as_ref()
            .ok_or(TlsError::Incomplete("key_path"))?;

        for path in [ca_path, cert_path, key_path] {
            if !path.exists() {
                return Err(TlsError::FileNotFound(path.clone()));
            }
        }

        let ca_pem = fs::read(ca_path).await?;
        let cert_pem = fs::read(cert_path).await?;
        let key_pem = fs::read(key_path).await?;

        Ok(Self {
            identity: Identity::from_pem(cert_pem, key_pem),
            client_ca: Certificate::from_pem(ca_pem),
        })
    }

    /// tonic server config: present our identity, demand and verify a
    /// client certificate against the CA.
    pub fn server_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.client_ca.clone())
    }
}
