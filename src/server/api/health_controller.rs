use axum::Extension;
use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tracing::info;

use crate::logger::Logger;
use crate::server::dtos::health_dto::{
    AllowListSizes, DnsCacheClearedResponse, DnsCacheHealth, HealthResponse, HealthStatus,
    ServiceHealthDetails,
};
use crate::server::services::ProxyServices;
use crate::server::utils::domain_policy_utils::AllowList;
use crate::server::{get_app_version, get_uptime_seconds};

pub struct HealthController;

impl HealthController {
    /// no upstream calls here, a DoH outage shouldn't take the health check down with it
    pub async fn health_endpoint(
        Extension(services): Extension<ProxyServices>,
    ) -> (StatusCode, Json<HealthResponse>) {
        let policy = &services.policy;

        // with an empty asset list every proxied request is a 403, that's not a working proxy
        let status = if policy.patterns(AllowList::Asset).is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let response = HealthResponse {
            status,
            timestamp: Utc::now(),
            uptime_seconds: get_uptime_seconds(),
            version: get_app_version().to_string(),
            environment: Logger::environment_name(services.config.cargo_env).to_string(),
            services: ServiceHealthDetails {
                dns_cache: DnsCacheHealth {
                    entries: services.dns.cached_entries(),
                    resolver: services.config.doh_endpoint.clone(),
                },
                allow_lists: AllowListSizes {
                    embed: policy.patterns(AllowList::Embed).len(),
                    asset: policy.patterns(AllowList::Asset).len(),
                    direct: policy.patterns(AllowList::Direct).len(),
                },
            },
        };

        // degraded still answers 200, the process itself is up
        (StatusCode::OK, Json(response))
    }

    pub async fn clear_dns_cache(Extension(services): Extension<ProxyServices>) -> Response {
        let cleared = services.dns.clear();
        info!("DNS cache flushed on request ({} entries)", cleared);

        let mut response = Json(DnsCacheClearedResponse { cleared }).into_response();
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        response
    }
}
