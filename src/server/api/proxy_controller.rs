// the three pinned routes plus the plain passthrough. policy is always checked before anything
// touches the network, the redirect service does that for the pinned ones
use std::error::Error as StdError;

use axum::{
    Router,
    body::Bytes,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::server::{
    api::health_controller::HealthController,
    error::{AppResult, Error},
    extractors::ProxyTarget,
    services::{
        ProxyServices,
        proxy_services::DirectRedirectError,
        fetch_services::{BROWSER_USER_AGENT, FetchMode, FetchOptions, FetchResult},
    },
    utils::{
        compression_utils::ResponseEncoding,
        content_type_utils::{
            HTML_CONTENT_TYPE, M3U8_CONTENT_TYPE, MPEG_TS_CONTENT_TYPE, is_playlist_url,
            looks_like_playlist, resolve_content_type,
        },
        domain_policy_utils::AllowList,
        html_rewrite_utils::rewrite_html,
        m3u8_rewrite_utils::rewrite_m3u8,
        proxy_url_utils::{ASSET_ROUTE, RewriteContext, proxied},
    },
};

const EMBED_CSP: &str = "default-src * 'unsafe-inline' 'unsafe-eval' data: blob:; script-src * 'unsafe-inline' 'unsafe-eval' blob:; worker-src * blob:; style-src * 'unsafe-inline'; img-src * data: blob:; media-src * data: blob:; connect-src *; frame-src *;";

const ASSET_CACHE_CONTROL: &str = "public, max-age=3600";

pub struct ProxyController;

impl ProxyController {
    pub fn app() -> Router {
        Router::new()
            .route(
                "/",
                get(Self::direct)
                    .post(Self::direct)
                    .options(Self::preflight),
            )
            .route("/asset", get(Self::asset).options(Self::preflight))
            .route("/embed", get(Self::embed).options(Self::preflight))
            .route("/hls", get(Self::hls).options(Self::preflight))
            .route("/dns-cache", delete(HealthController::clear_dns_cache))
    }

    async fn preflight() -> impl IntoResponse {
        (
            StatusCode::NO_CONTENT,
            [
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, OPTIONS"),
                (header::ACCESS_CONTROL_ALLOW_HEADERS, "*"),
            ],
        )
    }

    /// binary passthrough of an allow-listed resource
    ///
    /// a 3xx isn't followed here, the caller gets a 302 back to this same route for the next hop
    async fn asset(
        ProxyTarget(target, services): ProxyTarget,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let result: AppResult<Response> = async {
            let fetched = services
                .redirects
                .fetch_once(&target, AllowList::Asset, &FetchOptions::binary(None))
                .await?;

            if fetched.is_redirect() {
                return Self::redirect_through_asset_route(&services, &target, &fetched);
            }

            Self::ensure_ok(&target, &fetched)?;

            let content_type = resolve_content_type(&fetched.headers, &target);
            Self::binary_response(&headers, fetched, &content_type)
        }
        .await;

        Self::track("asset", result)
    }

    /// fetch a page (following redirects) and rewrite it so it keeps loading through us
    async fn embed(
        ProxyTarget(target, services): ProxyTarget,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let result: AppResult<Response> = async {
            let referer = Self::inbound_referer(&headers, &services.config.default_referer());
            let (final_url, fetched) = services
                .redirects
                .fetch_following_redirects(
                    &target,
                    AllowList::Embed,
                    &FetchOptions::text(Some(referer)),
                )
                .await?;

            Self::ensure_ok(&final_url, &fetched)?;

            // relative urls in the page belong to wherever we ended up, not where we started
            let ctx = RewriteContext::for_url(&final_url);
            let html = rewrite_html(&fetched.body.into_text(), &ctx, &services.policy)?;
            debug!("Rewrote embed {} ({} bytes)", final_url, html.len());

            Self::text_response(
                &headers,
                html,
                HTML_CONTENT_TYPE,
                &[
                    (header::X_FRAME_OPTIONS, "ALLOWALL"),
                    (header::CONTENT_SECURITY_POLICY, EMBED_CSP),
                ],
            )
        }
        .await;

        Self::track("embed", result)
    }

    /// playlists get rewritten, anything else is a segment and passes through
    async fn hls(
        ProxyTarget(target, services): ProxyTarget,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let result: AppResult<Response> = async {
            let mode = if is_playlist_url(&target) {
                FetchMode::Text
            } else {
                FetchMode::Binary
            };
            let options = FetchOptions {
                referer: Some(services.config.default_referer()),
                mode,
            };

            let (final_url, fetched) = services
                .redirects
                .fetch_following_redirects(&target, AllowList::Asset, &options)
                .await?;

            Self::ensure_ok(&final_url, &fetched)?;

            if !looks_like_playlist(&final_url, &fetched.headers, fetched.body.as_bytes()) {
                debug!("Passing {} through as a segment", final_url);
                return Self::binary_response(&headers, fetched, MPEG_TS_CONTENT_TYPE);
            }

            let ctx = RewriteContext::new(&services.config.public_origin);
            let playlist = rewrite_m3u8(
                &fetched.body.into_text(),
                &final_url,
                &ctx,
                &services.policy,
            );
            debug!("Rewrote playlist {} ({} bytes)", final_url, playlist.len());

            Self::text_response(&headers, playlist, M3U8_CONTENT_TYPE, &[])
        }
        .await;

        Self::track("hls", result)
    }

    /// plain passthrough over the system resolver for the direct allow-list
    async fn direct(
        ProxyTarget(target, services): ProxyTarget,
        method: Method,
        headers: HeaderMap,
        body: Bytes,
    ) -> AppResult<Response> {
        let result: AppResult<Response> = async {
            if !services.policy.is_url_allowed(&target, AllowList::Direct) {
                warn!("Refusing direct proxy to {}", target);
                return Err(Error::PolicyViolation(target.to_string()));
            }

            let mut request = services
                .http
                .request(method.clone(), target.clone())
                .header(header::USER_AGENT, BROWSER_USER_AGENT)
                .header(header::REFERER, services.config.default_referer());

            if method == Method::POST {
                if let Some(content_type) = headers.get(header::CONTENT_TYPE) {
                    request = request.header(header::CONTENT_TYPE, content_type.clone());
                }
                request = request.body(body);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Self::direct_send_error(&target, e))?;

            let status = response.status();
            let upstream_headers = response.headers().clone();
            let bytes = response.bytes().await.map_err(|e| {
                error!("Failed to read direct response from {}: {}", target, e);
                Error::FetchFailure(format!("{}: {}", target.host_str().unwrap_or(""), e))
            })?;

            if !status.is_success() {
                return Err(Error::Upstream {
                    status,
                    body: String::from_utf8_lossy(&bytes).into_owned(),
                });
            }

            let content_type = resolve_content_type(&upstream_headers, &target);
            let mut response_headers = Self::cors_headers();
            Self::insert(&mut response_headers, header::CONTENT_TYPE, &content_type);
            Self::insert(&mut response_headers, header::CACHE_CONTROL, ASSET_CACHE_CONTROL);

            Ok((status, response_headers, bytes).into_response())
        }
        .await;

        Self::track("direct", result)
    }

    fn direct_send_error(target: &Url, e: reqwest::Error) -> Error {
        let refused = StdError::source(&e)
            .and_then(|source| source.downcast_ref::<DirectRedirectError>());

        match refused {
            Some(DirectRedirectError::OffList(next)) => {
                warn!("Direct proxy to {} redirected off the list to {}", target, next);
                Error::PolicyViolation(next.clone())
            }
            Some(DirectRedirectError::TooMany(limit)) => {
                warn!("Direct proxy to {} gave up after {} redirects", target, limit);
                Error::TooManyRedirects(*limit)
            }
            None => {
                error!("Direct proxy to {} failed: {}", target, e);
                Error::FetchFailure(format!("{}: {}", target.host_str().unwrap_or(""), e))
            }
        }
    }

    fn track(route: &'static str, result: AppResult<Response>) -> AppResult<Response> {
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!("proxy_requests_total", "route" => route, "outcome" => outcome)
            .increment(1);

        if let Err(e) = &result {
            info!("{} request failed: {}", route, e);
        }

        result
    }

    fn ensure_ok(url: &Url, fetched: &FetchResult) -> AppResult<()> {
        if fetched.status == StatusCode::OK {
            return Ok(());
        }

        error!(
            "Upstream {} (host {:?}) answered {}",
            url,
            url.host_str(),
            fetched.status
        );
        Err(Error::Upstream {
            status: fetched.status,
            body: String::from_utf8_lossy(fetched.body.as_bytes()).into_owned(),
        })
    }

    fn redirect_through_asset_route(
        services: &ProxyServices,
        current: &Url,
        fetched: &FetchResult,
    ) -> AppResult<Response> {
        let location = fetched.redirect_location.as_deref().unwrap_or_default();
        let next = current.join(location).map_err(|e| {
            warn!("Bad redirect location {:?} from {}: {}", location, current, e);
            Error::FetchFailure(format!("invalid redirect location from {}", current))
        })?;

        services.redirects.authorize(&next, AllowList::Asset)?;
        debug!("Asset {} redirected, bouncing caller to {}", current, next);

        let mut response_headers = Self::cors_headers();
        Self::insert(
            &mut response_headers,
            header::LOCATION,
            &proxied(ASSET_ROUTE, next.as_str()),
        );

        Ok((StatusCode::FOUND, response_headers).into_response())
    }

    // caller's Referer, then its Origin, then its Host, then ours
    fn inbound_referer(headers: &HeaderMap, default: &str) -> String {
        let get = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string())
        };

        get(header::REFERER)
            .or_else(|| get(header::ORIGIN).map(|o| format!("{}/", o.trim_end_matches('/'))))
            .or_else(|| get(header::HOST).map(|h| format!("https://{}/", h)))
            .unwrap_or_else(|| default.to_string())
    }

    fn cors_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        headers
    }

    fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
        match HeaderValue::from_str(value) {
            Ok(v) => {
                headers.insert(name, v);
            }
            Err(e) => error!("Dropping unrepresentable {} header {:?}: {}", name, value, e),
        }
    }

    /// rewritten html/playlists, compressed the way the caller asked for
    fn text_response(
        request_headers: &HeaderMap,
        body: String,
        content_type: &str,
        extra: &[(HeaderName, &str)],
    ) -> AppResult<Response> {
        let encoding = ResponseEncoding::negotiate(request_headers);

        let mut response_headers = Self::cors_headers();
        Self::insert(&mut response_headers, header::CONTENT_TYPE, content_type);
        Self::insert(&mut response_headers, header::CACHE_CONTROL, "no-cache");
        for (name, value) in extra {
            Self::insert(&mut response_headers, name.clone(), value);
        }

        let response_body = encoding.compress(body.as_bytes()).map_err(|e| {
            error!("Failed to compress response: {}", e);
            Error::InternalServerErrorWithContext("Failed to compress response".to_string())
        })?;
        if let Some(value) = encoding.as_header_value() {
            debug!(
                "Compressed {} with {} from {} to {} bytes",
                content_type,
                value,
                body.len(),
                response_body.len()
            );
            Self::insert(&mut response_headers, header::CONTENT_ENCODING, value);
        }

        Ok((StatusCode::OK, response_headers, response_body).into_response())
    }

    /// segments and assets, with single range support served from the full body
    fn binary_response(
        request_headers: &HeaderMap,
        fetched: FetchResult,
        content_type: &str,
    ) -> AppResult<Response> {
        let upstream_encoding = fetched
            .headers
            .get(header::CONTENT_ENCODING)
            .filter(|v| !v.as_bytes().eq_ignore_ascii_case(b"identity"))
            .cloned();
        let bytes = fetched.body.into_bytes();
        let total = bytes.len();

        let mut response_headers = Self::cors_headers();
        Self::insert(&mut response_headers, header::CONTENT_TYPE, content_type);
        Self::insert(&mut response_headers, header::CACHE_CONTROL, ASSET_CACHE_CONTROL);

        // ranges over an encoded body would be ranges over the wrong bytes
        if let Some(encoding) = upstream_encoding {
            response_headers.insert(header::CONTENT_ENCODING, encoding);
            return Ok((StatusCode::OK, response_headers, bytes).into_response());
        }

        Self::insert(&mut response_headers, header::ACCEPT_RANGES, "bytes");

        if let Some((start, end)) = Self::requested_range(request_headers, total) {
            debug!("Serving range {}-{} of {} bytes", start, end, total);
            Self::insert(
                &mut response_headers,
                header::CONTENT_RANGE,
                &format!("bytes {}-{}/{}", start, end, total),
            );
            return Ok((
                StatusCode::PARTIAL_CONTENT,
                response_headers,
                bytes.slice(start..=end),
            )
                .into_response());
        }

        let encoding = if Self::is_compressible(content_type) {
            ResponseEncoding::negotiate(request_headers)
        } else {
            ResponseEncoding::None
        };

        let Some(value) = encoding.as_header_value() else {
            return Ok((StatusCode::OK, response_headers, bytes).into_response());
        };

        let compressed = encoding.compress(&bytes).map_err(|e| {
            error!("Failed to compress {}: {}", content_type, e);
            Error::InternalServerErrorWithContext("Failed to compress response".to_string())
        })?;
        Self::insert(&mut response_headers, header::CONTENT_ENCODING, value);

        Ok((StatusCode::OK, response_headers, compressed).into_response())
    }

    // segments and images are already as small as they get
    fn is_compressible(content_type: &str) -> bool {
        content_type.starts_with("text/")
            || content_type.contains("javascript")
            || content_type.contains("json")
            || content_type.contains("svg")
            || content_type.contains("mpegurl")
    }

    /// `bytes=a-b`, `bytes=a-` or `bytes=-n`, only a single satisfiable range
    pub fn requested_range(headers: &HeaderMap, total: usize) -> Option<(usize, usize)> {
        if total == 0 {
            return None;
        }

        let byte_range = headers
            .get(header::RANGE)?
            .to_str()
            .ok()?
            .trim()
            .strip_prefix("bytes=")?;

        if byte_range.contains(',') {
            return None;
        }

        let (start, end) = byte_range.split_once('-')?;
        let last = total - 1;

        let (start, end) = match (start.trim(), end.trim()) {
            ("", "") => return None,
            ("", suffix) => {
                let len = suffix.parse::<usize>().ok()?.min(total);
                if len == 0 {
                    return None;
                }
                (total - len, last)
            }
            (start, "") => (start.parse().ok()?, last),
            (start, end) => (start.parse().ok()?, end.parse::<usize>().ok()?.min(last)),
        };

        (start <= end && start < total).then_some((start, end))
    }
}
