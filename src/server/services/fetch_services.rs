use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use mockall::automock;
use reqwest::{
    StatusCode,
    header::{self, HeaderMap, HeaderValue},
    redirect,
};
use rustls::ClientConfig;
use tracing::{debug, error};
use url::Url;

use crate::server::{
    error::{AppResult, Error},
    utils::{compression_utils::decode_body, tls_utils::pinned_client_config},
};

pub type DynPinnedFetchService = Arc<dyn PinnedFetchServiceTrait + Send + Sync>;

// addresses rotate with DNS, stale clients are only dropped once this many pile up
const MAX_CACHED_CLIENTS: usize = 256;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// decoded and handed back as a string, for html and playlists
    Text,
    /// raw bytes, asks upstream not to compress
    Binary,
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub referer: Option<String>,
    pub mode: FetchMode,
}

impl FetchOptions {
    pub fn text(referer: Option<String>) -> Self {
        Self {
            referer,
            mode: FetchMode::Text,
        }
    }

    pub fn binary(referer: Option<String>) -> Self {
        Self {
            referer,
            mode: FetchMode::Binary,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FetchBody {
    Text(String),
    Binary(Bytes),
}

impl FetchBody {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Text(text) => Bytes::from(text),
            Self::Binary(bytes) => bytes,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        }
    }
}

/// one upstream response, never followed
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: FetchBody,
    /// raw `Location` of a 3xx, still relative if upstream sent it that way
    pub redirect_location: Option<String>,
}

impl FetchResult {
    pub fn is_redirect(&self) -> bool {
        self.status.is_redirection() && self.redirect_location.is_some()
    }
}

#[automock]
#[async_trait]
pub trait PinnedFetchServiceTrait {
    /// fetch `url` from `ip`, keeping the url's hostname for SNI and the Host header
    async fn fetch(&self, url: &Url, ip: Ipv4Addr, options: &FetchOptions) -> AppResult<FetchResult>;
}

/// http/1.1 client pinned to an address resolved by us
///
/// reqwest's resolver override does the pinning: the connection goes to `ip` while the url, and
/// with it SNI and `Host`, keeps the real hostname. redirects are off, the walker owns them.
/// one client is kept per (host, address) so consecutive segments reuse the connection
pub struct PinnedFetchService {
    tls: ClientConfig,
    timeout: Duration,
    default_referer: String,
    clients: RwLock<HashMap<(String, SocketAddr), reqwest::Client>>,
}

impl PinnedFetchService {
    pub fn new(
        timeout: Duration,
        default_referer: impl Into<String>,
        tolerate_cert_name_mismatch: bool,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            tls: pinned_client_config(tolerate_cert_name_mismatch)?,
            timeout,
            default_referer: default_referer.into(),
            clients: RwLock::new(HashMap::new()),
        })
    }

    pub fn cached_clients(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn client_for(&self, host: &str, addr: SocketAddr) -> AppResult<reqwest::Client> {
        let key = (host.to_string(), addr);

        if let Some(client) = self
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(client.clone());
        }

        let client = self.build_client(host, addr)?;

        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        if clients.len() >= MAX_CACHED_CLIENTS {
            debug!("Dropping {} cached pinned clients", clients.len());
            clients.clear();
        }

        Ok(clients.entry(key).or_insert(client).clone())
    }

    fn build_client(&self, host: &str, addr: SocketAddr) -> AppResult<reqwest::Client> {
        reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(self.timeout)
            .http1_only()
            .no_proxy()
            .resolve(host, addr)
            .use_preconfigured_tls(self.tls.clone())
            .build()
            .map_err(|e| {
                error!("Failed to build pinned client for {}: {}", host, e);
                Error::InternalServerErrorWithContext(format!("Failed to build client: {}", e))
            })
    }

    fn browser_headers(&self, options: &FetchOptions) -> HeaderMap {
        let referer = options
            .referer
            .clone()
            .unwrap_or_else(|| self.default_referer.clone());
        let origin = Url::parse(&referer)
            .map(|u| u.origin().ascii_serialization())
            .unwrap_or_else(|_| referer.trim_end_matches('/').to_string());

        let (accept, accept_encoding) = match options.mode {
            FetchMode::Text => (
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                "gzip, deflate, br, zstd",
            ),
            FetchMode::Binary => ("*/*", "identity"),
        };

        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(header::ACCEPT, HeaderValue::from_static(accept));
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static(accept_encoding));
        headers.insert("sec-fetch-dest", HeaderValue::from_static("iframe"));
        headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
        headers.insert("sec-fetch-site", HeaderValue::from_static("cross-site"));
        headers.insert("sec-fetch-user", HeaderValue::from_static("?1"));

        // a caller supplied referer with junk in it just isn't forwarded
        if let Ok(value) = HeaderValue::from_str(&referer) {
            headers.insert(header::REFERER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&origin) {
            headers.insert(header::ORIGIN, value);
        }

        headers
    }
}

#[async_trait]
impl PinnedFetchServiceTrait for PinnedFetchService {
    async fn fetch(&self, url: &Url, ip: Ipv4Addr, options: &FetchOptions) -> AppResult<FetchResult> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::BadRequest(format!("URL has no host: {}", url)))?;
        let port = url.port_or_known_default().unwrap_or(443);
        let client = self.client_for(host, SocketAddr::new(IpAddr::V4(ip), port))?;

        debug!("Fetching {} via {}:{} ({:?})", url, ip, port, options.mode);

        // Host comes from the url itself, which still carries the real hostname
        let response = client
            .get(url.clone())
            .headers(self.browser_headers(options))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    error!("Fetch of {} ({}) timed out after {:?}", url, ip, self.timeout);
                    Error::FetchFailure(format!("{} timed out", host))
                } else {
                    error!("Fetch of {} ({}) failed: {}", url, ip, e);
                    Error::FetchFailure(format!("{}: {}", host, e))
                }
            })?;

        let status = response.status();
        let mut headers = response.headers().clone();
        let redirect_location = status
            .is_redirection()
            .then(|| headers.get(header::LOCATION))
            .flatten()
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let bytes = response.bytes().await.map_err(|e| {
            error!("Failed to read body of {} ({}): {}", url, ip, e);
            if e.is_timeout() {
                Error::FetchFailure(format!("{} timed out", host))
            } else {
                Error::FetchFailure(format!("{}: {}", host, e))
            }
        })?;

        debug!("{} answered {} with {} bytes", url, status, bytes.len());

        let body = match options.mode {
            FetchMode::Binary => FetchBody::Binary(bytes),
            FetchMode::Text => {
                let encoding = headers
                    .get(header::CONTENT_ENCODING)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                let decoded = decode_body(&bytes, encoding.as_deref()).map_err(|e| {
                    error!("Failed to decode {:?} body of {}: {}", encoding, url, e);
                    Error::FetchFailure(format!("{}: undecodable body", host))
                })?;

                // the body is plain now, these would lie to whoever forwards the headers
                headers.remove(header::CONTENT_ENCODING);
                headers.remove(header::CONTENT_LENGTH);

                FetchBody::Text(String::from_utf8_lossy(&decoded).into_owned())
            }
        };

        Ok(FetchResult {
            status,
            headers,
            body,
            redirect_location,
        })
    }
}
