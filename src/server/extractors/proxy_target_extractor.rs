use axum::Extension;
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use base64::{Engine as _, engine::general_purpose::URL_SAFE};
use serde::Deserialize;
use tracing::{debug, error};
use url::Url;

use crate::server::error::{AppResult, Error};
use crate::server::services::ProxyServices;

#[derive(Deserialize)]
struct ProxyQuery {
    url: Option<String>,
}

/// the validated `?url=` target of a proxy route plus the services to fetch it with
///
/// this only checks that the target is a well formed http(s) url, the allow-list is checked by
/// whoever fetches it since that's where the list is known
pub struct ProxyTarget(pub Url, pub ProxyServices);

impl<S> FromRequestParts<S> for ProxyTarget
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Extension(services): Extension<ProxyServices> =
            Extension::from_request_parts(parts, state)
                .await
                .map_err(|err| Error::InternalServerErrorWithContext(err.to_string()))?;

        let Query(query): Query<ProxyQuery> = Query::from_request_parts(parts, state)
            .await
            .map_err(|err| {
                error!("Unparsable proxy query: {}", err);
                Error::BadRequest("Invalid query string".to_string())
            })?;

        let raw = query
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| Error::BadRequest("Missing url parameter".to_string()))?;

        let target = parse_target(&raw)?;
        debug!("Proxy target: {}", target);

        Ok(ProxyTarget(target, services))
    }
}

/// a plain http(s) url, or the unpadded base64url form of one
pub fn parse_target(raw: &str) -> AppResult<Url> {
    let raw = raw.trim();
    let decoded = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        decode_base64_url(raw)?
    };

    let url = Url::parse(&decoded).map_err(|e| {
        error!("Invalid target url {:?}: {}", decoded, e);
        Error::BadRequest("Invalid URL format".to_string())
    })?;

    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(Error::BadRequest("Invalid URL format".to_string()));
    }

    Ok(url)
}

fn decode_base64_url(raw: &str) -> AppResult<String> {
    let mut padded = raw.to_string();
    while !padded.len().is_multiple_of(4) {
        padded.push('=');
    }

    let bytes = URL_SAFE.decode(&padded).map_err(|e| {
        error!("Failed to decode base64 url: {}", e);
        Error::BadRequest("Invalid URL encoding".to_string())
    })?;

    String::from_utf8(bytes).map_err(|e| {
        error!("Decoded url is not UTF-8: {}", e);
        Error::BadRequest("Invalid URL encoding".to_string())
    })
}
