use std::sync::Arc;

use tracing::{debug, warn};
use url::Url;

use crate::server::{
    error::{AppResult, Error},
    services::{
        dns_services::DynDnsService,
        fetch_services::{DynPinnedFetchService, FetchOptions, FetchResult},
    },
    utils::domain_policy_utils::{AllowList, DomainPolicy},
};

/// the only place redirects are followed
///
/// every hop is resolved through our own DNS, fetched pinned and checked against the same
/// allow-list as the first url, so a redirect can't walk us off the list
pub struct RedirectService {
    dns: DynDnsService,
    fetcher: DynPinnedFetchService,
    policy: Arc<DomainPolicy>,
    max_hops: usize,
}

impl RedirectService {
    pub fn new(
        dns: DynDnsService,
        fetcher: DynPinnedFetchService,
        policy: Arc<DomainPolicy>,
        max_hops: usize,
    ) -> Self {
        Self {
            dns,
            fetcher,
            policy,
            max_hops,
        }
    }

    pub fn authorize(&self, url: &Url, list: AllowList) -> AppResult<()> {
        if self.policy.is_url_allowed(url, list) {
            Ok(())
        } else {
            warn!(
                "Refusing {} (host {:?}), not on the {} list",
                url,
                url.host_str(),
                list.as_str()
            );
            Err(Error::PolicyViolation(url.to_string()))
        }
    }

    /// a single policy checked, pinned fetch. 3xx answers come back as they are
    pub async fn fetch_once(
        &self,
        url: &Url,
        list: AllowList,
        options: &FetchOptions,
    ) -> AppResult<FetchResult> {
        self.authorize(url, list)?;

        let host = url
            .host_str()
            .ok_or_else(|| Error::PolicyViolation(url.to_string()))?;
        let ip = self.dns.resolve(host).await?;

        self.fetcher.fetch(url, ip, options).await
    }

    /// follow up to `max_hops` redirects and return the final url with its response
    pub async fn fetch_following_redirects(
        &self,
        url: &Url,
        list: AllowList,
        options: &FetchOptions,
    ) -> AppResult<(Url, FetchResult)> {
        let mut current = url.clone();
        let mut followed = 0;

        loop {
            let result = self.fetch_once(&current, list, options).await?;

            let Some(location) = result
                .redirect_location
                .as_deref()
                .filter(|_| result.status.is_redirection())
            else {
                return Ok((current, result));
            };

            let next = current.join(location).map_err(|e| {
                warn!("Bad redirect location {:?} from {}: {}", location, current, e);
                Error::FetchFailure(format!("invalid redirect location from {}", current))
            })?;

            // leaving the list is worse than looping, so that's checked first
            self.authorize(&next, list)?;

            if followed == self.max_hops {
                warn!("Giving up on {} after {} redirects", url, followed);
                return Err(Error::TooManyRedirects(self.max_hops));
            }

            followed += 1;
            metrics::counter!("upstream_redirects_total").increment(1);
            debug!("Redirect {}/{}: {} -> {}", followed, self.max_hops, current, next);
            current = next;
        }
    }
}
