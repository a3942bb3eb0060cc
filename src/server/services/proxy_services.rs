use std::sync::Arc;
use std::time::Duration;

use reqwest::redirect;
use tracing::info;

use crate::{
    config::AppConfig,
    server::utils::domain_policy_utils::{AllowList, DomainPolicy},
};

use super::{
    dns_services::{DnsService, DynDnsService, ReqwestDohTransport, SystemClock},
    fetch_services::{DynPinnedFetchService, PinnedFetchService},
    redirect_services::RedirectService,
};

/// why the direct client refused to follow a redirect, carried inside reqwest's error
#[derive(Debug, thiserror::Error)]
pub enum DirectRedirectError {
    #[error("too many redirects (limit {0})")]
    TooMany(usize),
    #[error("redirect to {0} left the allow-list")]
    OffList(String),
}

/// everything a handler needs, cloned into every request as an axum extension
#[derive(Clone)]
pub struct ProxyServices {
    pub policy: Arc<DomainPolicy>,
    pub dns: DynDnsService,
    pub fetcher: DynPinnedFetchService,
    pub redirects: Arc<RedirectService>,
    // plain system resolver client for the direct route
    pub http: reqwest::Client,
    pub config: Arc<AppConfig>,
}

impl ProxyServices {
    pub fn new(config: Arc<AppConfig>) -> anyhow::Result<Self> {
        info!("starting proxy services...");

        let transport = ReqwestDohTransport::new(
            config.doh_endpoint.clone(),
            Duration::from_secs(config.dns_timeout_secs),
        )?;
        let dns = Arc::new(DnsService::new(
            Arc::new(transport),
            Arc::new(SystemClock),
            Duration::from_secs(config.dns_min_ttl_secs),
        )) as DynDnsService;

        info!("resolver ok ({}), building pinned client...", config.doh_endpoint);

        let fetcher = Arc::new(PinnedFetchService::new(
            Duration::from_secs(config.fetch_timeout_secs),
            config.default_referer(),
            config.tolerate_cert_name_mismatch,
        )?) as DynPinnedFetchService;

        Self::with_components(config, dns, fetcher)
    }

    /// wire up around an existing resolver and fetcher, tests hand in mocks here
    pub fn with_components(
        config: Arc<AppConfig>,
        dns: DynDnsService,
        fetcher: DynPinnedFetchService,
    ) -> anyhow::Result<Self> {
        let policy = Arc::new(DomainPolicy::new(
            &config.embed_domains,
            &config.asset_domains,
            &config.direct_domains,
        ));

        let redirects = Arc::new(RedirectService::new(
            dns.clone(),
            fetcher.clone(),
            policy.clone(),
            config.max_redirects,
        ));

        let http = Self::direct_client(policy.clone(), &config)?;

        Ok(Self {
            policy,
            dns,
            fetcher,
            redirects,
            http,
            config,
        })
    }

    // redirects are followed by reqwest here but each hop still has to stay on the direct list
    fn direct_client(policy: Arc<DomainPolicy>, config: &AppConfig) -> anyhow::Result<reqwest::Client> {
        let max_hops = config.max_redirects;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .redirect(redirect::Policy::custom(move |attempt| {
                if !policy.is_url_allowed(attempt.url(), AllowList::Direct) {
                    let next = attempt.url().to_string();
                    attempt.error(DirectRedirectError::OffList(next))
                } else if attempt.previous().len() > max_hops {
                    attempt.error(DirectRedirectError::TooMany(max_hops))
                } else {
                    attempt.follow()
                }
            }))
            .build()?;

        Ok(client)
    }
}
