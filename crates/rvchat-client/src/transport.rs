//! Transport dialing for the server session.
//!
//! The session is written against [`Dialer`], so tests can substitute
//! an in-memory duplex transport. Production uses [`TlsDialer`]: TCP +
//! rustls with either webpki roots from the system or a pinned
//! certificate provided in the configuration.

use std::sync::Arc;

use async_trait::async_trait;
use rvchat_types::{Result, RvChatError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig as TlsConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// A bidirectional byte stream to the relay.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

/// Dials the relay server.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Establishes a fresh connection.
    async fn dial(&self) -> Result<Box<dyn Conn>>;
}

// ---------------------------------------------------------------------------
// TlsDialer
// ---------------------------------------------------------------------------

/// TCP + TLS dialer for production use.
pub struct TlsDialer {
    addr: String,
    server_name: String,
    tls: Arc<TlsConfig>,
}

impl TlsDialer {
    /// Creates a dialer for `addr` (`host:port`), optionally trusting a
    /// pinned PEM certificate instead of the webpki roots.
    pub fn new(addr: &str, pinned_cert_pem: Option<&[u8]>) -> Result<Self> {
        let server_name = addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| addr.to_string());

        let mut roots = RootCertStore::empty();
        match pinned_cert_pem {
            Some(pem) => {
                let mut reader = std::io::BufReader::new(pem);
                for cert in rustls_pemfile::certs(&mut reader) {
                    let cert = cert.map_err(|e| RvChatError::Config {
                        reason: format!("invalid pinned certificate: {e}"),
                    })?;
                    roots.add(cert).map_err(|e| RvChatError::Config {
                        reason: format!("unusable pinned certificate: {e}"),
                    })?;
                }
            }
            None => {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
        }

        let tls = TlsConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            addr: addr.to_string(),
            server_name,
            tls: Arc::new(tls),
        })
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self) -> Result<Box<dyn Conn>> {
        let tcp = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| RvChatError::Transport {
                reason: format!("TCP connect to {} failed: {e}", self.addr),
            })?;

        let name = ServerName::try_from(self.server_name.clone()).map_err(|e| {
            RvChatError::Config {
                reason: format!("invalid server name '{}': {e}", self.server_name),
            }
        })?;

        let connector = TlsConnector::from(self.tls.clone());
        let stream = connector
            .connect(name, tcp)
            .await
            .map_err(|e| RvChatError::Transport {
                reason: format!("TLS handshake with {} failed: {e}", self.addr),
            })?;

        Ok(Box::new(stream))
    }
}
