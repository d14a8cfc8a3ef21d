//! The top-level entry point (§1, §4.5). One `Client` opens one connection
//! per authority and hands off requests to it; generalizes the teacher's
//! synchronous single-socket `Client::get` to an async, multiplexing
//! connection per host.
use crate::connection::{ClientConfig, Connection, ConnectionStatsSnapshot};
use crate::error::H2Error;
use crate::request::Request;
use crate::response::Response;
use dashmap::DashMap;
use log::trace;
use std::sync::Arc;
use tokio::sync::Mutex;
use url::Url;

/// Key used to reuse a connection across requests to the same origin.
fn authority(url: &Url) -> Option<(String, u16)> {
    let host = url.host_str()?.to_owned();
    let port = url.port_or_known_default()?;
    Some((host, port))
}

pub struct Client {
    rustls_config: Arc<rustls::ClientConfig>,
    config: ClientConfig,
    connections: DashMap<(String, u16), Arc<Mutex<Arc<Connection>>>>,
}

impl Client {
    #[must_use]
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            rustls_config: crate::transport::default_rustls_config(),
            config,
            connections: DashMap::new(),
        }
    }

    pub async fn request(&self, request: Request) -> Result<Response, H2Error> {
        let connection = self.connection_for(&request.url).await?;
        trace!("{} {}", request.url, request.id);
        connection.request(request).await
    }

    pub async fn get(&self, url: Url) -> Result<Response, H2Error> {
        self.request(Request::get(url, None)).await
    }

    /// Read-only counters for the connection currently open to `url`'s
    /// authority, if any (§6).
    pub async fn stats_for(&self, url: &Url) -> Option<ConnectionStatsSnapshot> {
        let key = authority(url)?;
        let slot = self.connections.get(&key)?;
        let guard = slot.lock().await;
        (!guard.is_closed()).then(|| guard.stats())
    }

    /// Gracefully closes the connection currently open to `url`'s authority,
    /// if any, letting in-flight requests finish (§4.5).
    pub async fn close(&self, url: &Url) {
        let Some(key) = authority(url) else { return };
        if let Some(slot) = self.connections.get(&key) {
            slot.lock().await.close().await;
        }
    }

    async fn connection_for(&self, url: &Url) -> Result<Arc<Connection>, H2Error> {
        let key = authority(url).ok_or(H2Error::Protocol("URL has no authority"))?;
        if let Some(slot) = self.connections.get(&key) {
            let guard = slot.lock().await;
            if !guard.is_closed() {
                return Ok(guard.clone());
            }
        }
        let connection = Arc::new(Connection::connect(url, self.rustls_config.clone(), self.config).await?);
        let slot = self
            .connections
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(connection.clone())));
        let mut guard = slot.lock().await;
        if guard.is_closed() {
            *guard = connection;
        }
        Ok(guard.clone())
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::with_config(ClientConfig::default())
    }
}
