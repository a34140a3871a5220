/// Mutual TLS credentials for hub and agent channels
use crate::config::TlsConfig;
use crate::error::{HubError, HubResult};
use openssl::ssl::{Ssl, SslAcceptor, SslConnector, SslFiletype, SslMethod, SslVerifyMode};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

/// Source of TLS contexts. Both sides always verify the peer.
pub trait Credentials: Send + Sync {
    /// Context for outgoing connections (hub to agent, CLI to hub)
    fn client_connector(&self) -> HubResult<SslConnector>;

    /// Context for incoming connections (hub server)
    fn server_acceptor(&self) -> HubResult<SslAcceptor>;
}

/// Credentials loaded from PEM files on disk
#[derive(Debug, Clone)]
pub struct PemCredentials {
    pub ca_cert: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

impl PemCredentials {
    pub fn from_config(config: &TlsConfig) -> Self {
        Self {
            ca_cert: config.ca_cert.clone(),
            server_cert: config.server_cert.clone(),
            server_key: config.server_key.clone(),
            client_cert: config.client_cert.clone(),
            client_key: config.client_key.clone(),
        }
    }
}

fn load_error(what: &str, path: &Path, err: openssl::error::ErrorStack) -> HubError {
    HubError::tls(format!("loading {} {}: {}", what, path.display(), err))
}

impl Credentials for PemCredentials {
    fn client_connector(&self) -> HubResult<SslConnector> {
        let mut builder = SslConnector::builder(SslMethod::tls())?;
        builder
            .set_ca_file(&self.ca_cert)
            .map_err(|e| load_error("CA certificate", &self.ca_cert, e))?;
        builder
            .set_certificate_chain_file(&self.client_cert)
            .map_err(|e| load_error("client certificate", &self.client_cert, e))?;
        builder
            .set_private_key_file(&self.client_key, SslFiletype::PEM)
            .map_err(|e| load_error("client key", &self.client_key, e))?;
        builder.set_verify(SslVerifyMode::PEER);
        Ok(builder.build())
    }

    fn server_acceptor(&self) -> HubResult<SslAcceptor> {
        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
        builder
            .set_ca_file(&self.ca_cert)
            .map_err(|e| load_error("CA certificate", &self.ca_cert, e))?;
        builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
        builder
            .set_certificate_chain_file(&self.server_cert)
            .map_err(|e| load_error("server certificate", &self.server_cert, e))?;
        builder
            .set_private_key_file(&self.server_key, SslFiletype::PEM)
            .map_err(|e| load_error("server key", &self.server_key, e))?;
        Ok(builder.build())
    }
}

/// Client handshake over an established TCP stream
pub async fn connect_tls(
    credentials: &Arc<dyn Credentials>,
    domain: &str,
    tcp: TcpStream,
) -> HubResult<SslStream<TcpStream>> {
    let ssl = credentials
        .client_connector()?
        .configure()?
        .into_ssl(domain)?;
    let mut stream = SslStream::new(ssl, tcp)?;
    Pin::new(&mut stream)
        .connect()
        .await
        .map_err(|e| HubError::tls(format!("handshake with {}: {}", domain, e)))?;
    Ok(stream)
}

/// Server handshake over an accepted TCP stream
pub async fn accept_tls(
    acceptor: &SslAcceptor,
    tcp: TcpStream,
) -> HubResult<SslStream<TcpStream>> {
    let ssl = Ssl::new(acceptor.context())?;
    let mut stream = SslStream::new(ssl, tcp)?;
    Pin::new(&mut stream)
        .accept()
        .await
        .map_err(|e| HubError::tls(format!("handshake: {}", e)))?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_from_config() {
        let config = Config::default();
        let creds = PemCredentials::from_config(&config.tls);
        assert_eq!(creds.ca_cert, config.tls.ca_cert);
        assert_eq!(creds.client_key, config.tls.client_key);
    }

    #[test]
    fn test_missing_files_name_the_path() {
        let creds = PemCredentials {
            ca_cert: PathBuf::from("/nonexistent/ca.crt"),
            server_cert: PathBuf::from("/nonexistent/server.crt"),
            server_key: PathBuf::from("/nonexistent/server.key"),
            client_cert: PathBuf::from("/nonexistent/client.crt"),
            client_key: PathBuf::from("/nonexistent/client.key"),
        };

        let err = creds.client_connector().err().unwrap();
        assert!(matches!(err, HubError::Tls { .. }));
        assert!(err.to_string().contains("/nonexistent/ca.crt"));

        let err = creds.server_acceptor().err().unwrap();
        assert!(err.to_string().contains("/nonexistent/ca.crt"));
    }
}
