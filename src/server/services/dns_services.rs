use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mockall::automock;
use reqwest::header;
use tracing::{debug, error, info, warn};

use crate::server::{
    dtos::doh_dto::DohResponse,
    error::{AppResult, Error},
};

// resolvers cap TTLs at 2^31 - 1 anyway, anything above that is a broken answer
const MAX_TTL_SECS: u64 = i32::MAX as u64;

pub type DynDohTransport = Arc<dyn DohTransportTrait + Send + Sync>;
pub type DynDnsService = Arc<dyn DnsServiceTrait + Send + Sync>;
pub type DynClock = Arc<dyn Clock + Send + Sync>;

/// monotonic time source, swapped out in tests to expire cache entries without sleeping
pub trait Clock {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// raw DoH round trip, no caching
#[automock]
#[async_trait]
pub trait DohTransportTrait {
    async fn query_a(&self, host: &str) -> AppResult<DohResponse>;
}

pub struct ReqwestDohTransport {
    http: reqwest::Client,
    endpoint: String,
}

impl ReqwestDohTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl DohTransportTrait for ReqwestDohTransport {
    async fn query_a(&self, host: &str) -> AppResult<DohResponse> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("name", host), ("type", "A")])
            .header(header::ACCEPT, "application/dns-json")
            .send()
            .await
            .map_err(|e| {
                error!("DoH query for {} failed: {}", host, e);
                Error::DnsFailure(host.to_string())
            })?;

        if !response.status().is_success() {
            error!("DoH endpoint answered {} for {}", response.status(), host);
            return Err(Error::DnsFailure(host.to_string()));
        }

        response.json::<DohResponse>().await.map_err(|e| {
            error!("Malformed DoH answer for {}: {}", host, e);
            Error::DnsFailure(host.to_string())
        })
    }
}

#[automock]
#[async_trait]
pub trait DnsServiceTrait {
    /// hostname to IPv4, from cache when the entry is still live
    async fn resolve(&self, host: &str) -> AppResult<Ipv4Addr>;

    /// number of entries currently held, expired ones included
    fn cached_entries(&self) -> usize;

    /// drop every entry, returns how many there were
    fn clear(&self) -> usize;
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    ip: Ipv4Addr,
    expires_at: Instant,
}

/// DoH resolver with a process wide ttl cache
///
/// two cold lookups racing for the same host both go upstream and the last write wins, that's
/// fine for a handful of allow-listed hosts. failures are never cached
pub struct DnsService {
    transport: DynDohTransport,
    clock: DynClock,
    min_ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl DnsService {
    pub fn new(transport: DynDohTransport, clock: DynClock, min_ttl: Duration) -> Self {
        info!("starting DoH resolver (min ttl {}s)...", min_ttl.as_secs());

        Self {
            transport,
            clock,
            min_ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn cached(&self, host: &str, now: Instant) -> Option<Ipv4Addr> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache
            .get(host)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.ip)
    }

    fn store(&self, host: String, entry: CacheEntry) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.insert(host, entry);
    }
}

#[async_trait]
impl DnsServiceTrait for DnsService {
    async fn resolve(&self, host: &str) -> AppResult<Ipv4Addr> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();

        if host.is_empty() {
            return Err(Error::DnsFailure("empty hostname".to_string()));
        }

        // literal addresses never hit the resolver
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(ip);
        }

        if let Some(ip) = self.cached(&host, self.clock.now()) {
            debug!("DNS cache hit: {} -> {}", host, ip);
            metrics::counter!("dns_cache_lookups_total", "result" => "hit").increment(1);
            return Ok(ip);
        }
        metrics::counter!("dns_cache_lookups_total", "result" => "miss").increment(1);

        let response = self.transport.query_a(&host).await?;

        if response.status != 0 {
            warn!("DoH answered status {} for {}", response.status, host);
            return Err(Error::DnsFailure(host));
        }

        let Some(record) = response.first_a_record() else {
            warn!("No A record for {}", host);
            return Err(Error::DnsFailure(host));
        };

        let ip = record.data.trim().parse::<Ipv4Addr>().map_err(|e| {
            error!("A record for {} is not an IPv4 address ({}): {}", host, record.data, e);
            Error::DnsFailure(host.clone())
        })?;

        let ttl = Duration::from_secs(record.ttl.min(MAX_TTL_SECS)).max(self.min_ttl);
        debug!("Resolved {} -> {} (ttl {}s)", host, ip, ttl.as_secs());

        let now = self.clock.now();
        let expires_at = now
            .checked_add(ttl)
            .or_else(|| now.checked_add(self.min_ttl))
            .unwrap_or(now);

        self.store(host, CacheEntry { ip, expires_at });

        Ok(ip)
    }

    fn cached_entries(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn clear(&self) -> usize {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let cleared = cache.len();
        cache.clear();
        info!("DNS cache cleared ({} entries)", cleared);
        cleared
    }
}
