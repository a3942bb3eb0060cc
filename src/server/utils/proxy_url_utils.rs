use url::Url;

pub const ASSET_ROUTE: &str = "/proxy/asset";
pub const HLS_ROUTE: &str = "/proxy/hls";

/// per request parameters threaded through the rewriters
#[derive(Debug, Clone)]
pub struct RewriteContext {
    /// scheme://host[:port] of the document being rewritten
    pub base_origin: String,
    pub asset_route: String,
    pub hls_route: String,
}

impl RewriteContext {
    pub fn new(base_origin: impl Into<String>) -> Self {
        Self {
            base_origin: base_origin.into().trim_end_matches('/').to_string(),
            asset_route: ASSET_ROUTE.to_string(),
            hls_route: HLS_ROUTE.to_string(),
        }
    }

    pub fn for_url(url: &Url) -> Self {
        Self::new(url.origin().ascii_serialization())
    }

    pub fn asset_url(&self, target: &str) -> String {
        proxied(&self.asset_route, target)
    }

    pub fn hls_url(&self, target: &str) -> String {
        proxied(&self.hls_route, target)
    }
}

/// `<route>?url=<percent encoded target>`
pub fn proxied(route: &str, target: &str) -> String {
    format!("{}?url={}", route, urlencoding::encode(target))
}

pub fn is_http_url(value: &str) -> bool {
    let lower = value.get(..8).unwrap_or(value).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
