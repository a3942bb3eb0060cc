use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub version: String,
    pub environment: String,
    pub services: ServiceHealthDetails,
}

#[derive(Debug, Serialize)]
pub struct ServiceHealthDetails {
    pub dns_cache: DnsCacheHealth,
    pub allow_lists: AllowListSizes,
}

#[derive(Debug, Serialize)]
pub struct DnsCacheHealth {
    pub entries: usize,
    pub resolver: String,
}

#[derive(Debug, Serialize)]
pub struct AllowListSizes {
    pub embed: usize,
    pub asset: usize,
    pub direct: usize,
}

#[derive(Debug, Serialize)]
pub struct DnsCacheClearedResponse {
    pub cleared: usize,
}
