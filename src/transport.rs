//! The byte-oriented duplex the connection engine reads and writes (§6
//! "Transport"). Production connections go through TLS with ALPN `h2`
//! negotiation, grounded in the teacher's `socket.rs`/`client.rs`
//! `rustls::ClientConfig` setup, generalized from blocking `TcpStream` I/O
//! to `tokio_rustls`. Tests substitute `tokio::io::duplex` pipes.
use crate::error::H2Error;
use rustls::{OwnedTrustAnchor, RootCertStore};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use url::Url;

/// Any duplex byte stream the connection engine can drive: a live TLS
/// socket in production, an in-memory pipe in tests.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

#[must_use]
pub fn default_rustls_config() -> Arc<rustls::ClientConfig> {
    let mut root_store = RootCertStore::empty();
    root_store.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)
    }));
    let mut config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec()];
    Arc::new(config)
}

/// Opens a TCP connection, performs the TLS handshake, and confirms ALPN
/// selected `h2`. The 24-octet client preface and initial SETTINGS are the
/// connection engine's responsibility, not the transport's.
pub async fn connect_tls(
    url: &Url,
    rustls_config: Arc<rustls::ClientConfig>,
) -> Result<Box<dyn Transport>, H2Error> {
    let host = url
        .host_str()
        .ok_or(H2Error::Protocol("URL has no host"))?
        .to_owned();
    let port = url
        .port_or_known_default()
        .ok_or(H2Error::Protocol("URL has no resolvable port"))?;

    let tcp = TcpStream::connect((host.as_str(), port)).await?;
    tcp.set_nodelay(true).ok();

    let server_name = rustls::ServerName::try_from(host.as_str())
        .map_err(|_| H2Error::Protocol("invalid DNS name for SNI"))?;
    let connector = TlsConnector::from(rustls_config);
    let tls = connector.connect(server_name, tcp).await?;

    let (_, session) = tls.get_ref();
    match session.alpn_protocol() {
        Some(proto) if proto == b"h2" => Ok(Box::new(tls)),
        _ => Err(H2Error::Protocol("ALPN did not negotiate h2")),
    }
}
