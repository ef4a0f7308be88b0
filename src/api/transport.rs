use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Duration;

use crate::api::executor::{HttpResponse, Transport, TransportError};
use crate::config::ApiConfig;

/// Pooled, authenticated HTTPS transport backed by `reqwest`.
///
/// The underlying client is created lazily on the first request and
/// dropped by [`Transport::close`]. A later request after `close`
/// builds a fresh client.
///
/// LIMITS (active requests, each holding one connection):
/// - `max_connections` across all hosts
/// - `max_connections_per_host` towards any single host
///
/// Both permits are held until the body has been read.
pub struct HttpTransport {
    base_url: String,
    api_key: String,
    connect_timeout: Duration,
    max_connections_per_host: usize,
    in_flight: Arc<Semaphore>,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    client: Mutex<Option<reqwest::Client>>,
}

impl HttpTransport {
    pub fn new(cfg: &ApiConfig) -> Self {
        Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.key.clone(),
            connect_timeout: cfg.timeout(),
            max_connections_per_host: cfg.max_connections_per_host.max(1),
            in_flight: Arc::new(Semaphore::new(cfg.max_connections.max(1))),
            per_host: Mutex::new(HashMap::new()),
            client: Mutex::new(None),
        }
    }

    /// Waits for a global slot, then for a slot on `url`'s host.
    async fn permits(&self, url: &str) -> Result<[OwnedSemaphorePermit; 2], TransportError> {
        let host = reqwest::Url::parse(url)
            .map_err(|e| TransportError::Other(format!("invalid URL {url}: {e}")))?
            .host_str()
            .unwrap_or_default()
            .to_string();

        let host_slots = self
            .per_host
            .lock()
            .await
            .entry(host)
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_connections_per_host)))
            .clone();

        let closed = |_| TransportError::Other("connection limiter closed".to_string());
        let global = self.in_flight.clone().acquire_owned().await.map_err(closed)?;
        let local = host_slots.acquire_owned().await.map_err(closed)?;
        Ok([global, local])
    }

    async fn client(&self) -> Result<reqwest::Client, TransportError> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let client = self.build_client()?;
        debug!("HTTP connection pool created for {}", self.base_url);
        *slot = Some(client.clone());
        Ok(client)
    }

    fn build_client(&self) -> Result<reqwest::Client, TransportError> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| TransportError::Other(format!("invalid API key header: {e}")))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(self.connect_timeout)
            .pool_max_idle_per_host(self.max_connections_per_host)
            .build()
            .map_err(|e| TransportError::Other(format!("building HTTP client: {e}")))
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn get(&self, path: &str) -> Result<HttpResponse, TransportError> {
        let url = format!("{}{}", self.base_url, path);
        let _permits = self.permits(&url).await?;
        let client = self.client().await?;

        let resp = client.get(&url).send().await.map_err(map_reqwest_error)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(map_reqwest_error)?;

        Ok(HttpResponse { status, body })
    }

    async fn close(&self) {
        if self.client.lock().await.take().is_some() {
            info!("HTTP connection pool released");
        }
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}
