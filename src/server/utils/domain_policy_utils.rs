use url::Url;

/// which allow-list a request is checked against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowList {
    /// pages that may be fetched and rewritten as top level documents
    Embed,
    /// assets and streams, also the set of hosts the rewriters route back through the proxy
    Asset,
    /// hosts the plain passthrough route may reach with the system resolver
    Direct,
}

impl AllowList {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embed => "embed",
            Self::Asset => "asset",
            Self::Direct => "direct",
        }
    }
}

/// static allow-lists of origin domains
///
/// a pattern is either a bare hostname or `*.suffix`, both match the host itself and anything
/// below it on a dot boundary, so `example.com` matches `cdn.example.com` but never
/// `notexample.com`
#[derive(Debug, Clone, Default)]
pub struct DomainPolicy {
    embed: Vec<String>,
    asset: Vec<String>,
    direct: Vec<String>,
}

impl DomainPolicy {
    pub fn new<S: AsRef<str>>(embed: &[S], asset: &[S], direct: &[S]) -> Self {
        Self {
            embed: Self::normalize(embed),
            asset: Self::normalize(asset),
            direct: Self::normalize(direct),
        }
    }

    fn normalize<S: AsRef<str>>(patterns: &[S]) -> Vec<String> {
        patterns
            .iter()
            .map(|p| p.as_ref().trim())
            .map(|p| p.strip_prefix("*.").unwrap_or(p))
            .map(|p| p.trim_end_matches('.').to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .collect()
    }

    pub fn patterns(&self, list: AllowList) -> &[String] {
        match list {
            AllowList::Embed => &self.embed,
            AllowList::Asset => &self.asset,
            AllowList::Direct => &self.direct,
        }
    }

    /// parses `url` and checks its host, anything unparsable is simply not allowed
    pub fn is_allowed(&self, url: &str, list: AllowList) -> bool {
        Url::parse(url)
            .map(|u| self.is_url_allowed(&u, list))
            .unwrap_or(false)
    }

    pub fn is_url_allowed(&self, url: &Url, list: AllowList) -> bool {
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }

        url.host_str()
            .is_some_and(|host| self.is_host_allowed(host, list))
    }

    pub fn is_host_allowed(&self, host: &str, list: AllowList) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();

        self.patterns(list).iter().any(|pattern| {
            host == *pattern
                || host
                    .strip_suffix(pattern.as_str())
                    .is_some_and(|rest| rest.ends_with('.'))
        })
    }
}
