use std::cell::Cell;

use lol_html::{HtmlRewriter, Settings, element, html_content::ContentType, html_content::Element};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error};
use url::Url;

use crate::server::{
    error::{AppResult, Error},
    utils::{
        domain_policy_utils::{AllowList, DomainPolicy},
        proxy_url_utils::{RewriteContext, is_http_url},
    },
};

const INTERCEPTOR_TEMPLATE: &str = include_str!("interceptor.js");

// `"..." + x` or `x + '...'`, which only shows up when a url is being glued together in js
static CONCATENATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"['"]\s*\+|\+\s*['"]"#).expect("concatenation regex should compile")
});

static BASE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<base[\s/>]").expect("base tag regex should compile"));

static URL_SCHEME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.\-]*:").expect("url scheme regex should compile")
});

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// rewrite an embedded page so its allow-listed subresources come back through the proxy
///
/// runs on lol_html's streaming tokenizer, so only real `src`/`href` attributes are touched and
/// everything else is emitted byte for byte. the interceptor shim (and a `<base>` tag when the
/// page has none) goes at the top of the first `<head>`, or at the very top without one
pub fn rewrite_html(html: &str, ctx: &RewriteContext, policy: &DomainPolicy) -> AppResult<String> {
    let injection = head_injection(html, ctx, policy);
    let head_seen = Cell::new(false);
    let mut output = Vec::with_capacity(html.len() + injection.len());

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                element!("head", |el| {
                    if !head_seen.replace(true) {
                        el.prepend(&injection, ContentType::Html);
                    }
                    Ok(())
                }),
                element!("[src]", |el| rewrite_attribute(el, "src", ctx, policy)),
                element!("[href]", |el| {
                    // the base tag is ours to manage, rewriting it would break relative urls
                    if el.tag_name().eq_ignore_ascii_case("base") {
                        return Ok(());
                    }
                    rewrite_attribute(el, "href", ctx, policy)
                }),
            ],
            ..Settings::default()
        },
        |c: &[u8]| output.extend_from_slice(c),
    );

    rewriter.write(html.as_bytes()).map_err(|e| {
        error!("Failed to rewrite html: {}", e);
        Error::InternalServerErrorWithContext(format!("Failed to rewrite html: {}", e))
    })?;
    rewriter.end().map_err(|e| {
        error!("Failed to finish html rewrite: {}", e);
        Error::InternalServerErrorWithContext(format!("Failed to rewrite html: {}", e))
    })?;

    let mut rewritten = String::from_utf8(output).map_err(|e| {
        error!("Rewritten html is not UTF-8: {}", e);
        Error::InternalServerErrorWithContext("Rewritten html is not UTF-8".to_string())
    })?;

    if !head_seen.get() {
        debug!("Document has no <head>, injecting at the top");
        rewritten.insert_str(0, &injection);
    }

    Ok(rewritten)
}

fn rewrite_attribute(
    el: &mut Element<'_, '_>,
    name: &str,
    ctx: &RewriteContext,
    policy: &DomainPolicy,
) -> HandlerResult {
    let Some(value) = el.get_attribute(name) else {
        return Ok(());
    };

    if let Some(rewritten) = rewrite_url_value(&value, ctx, policy) {
        el.set_attribute(name, &rewritten)?;
    }

    Ok(())
}

/// new value for a `src`/`href` attribute, `None` leaves it alone
///
/// absolute urls only change when allow-listed. relative ones are resolved against the page
/// origin and then either proxied or left absolute, so the browser doesn't 404 against our own
/// origin. values that look like js string concatenation are skipped, this is a best effort
/// heuristic and not a guarantee
pub fn rewrite_url_value(value: &str, ctx: &RewriteContext, policy: &DomainPolicy) -> Option<String> {
    let trimmed = value.trim();

    if trimmed.is_empty() || CONCATENATION.is_match(trimmed) {
        return None;
    }

    let decoded = trimmed.replace("&amp;", "&");

    if is_http_url(&decoded) {
        let url = Url::parse(&decoded).ok()?;
        return policy
            .is_url_allowed(&url, AllowList::Asset)
            .then(|| ctx.asset_url(url.as_str()));
    }

    if is_internal_reference(&decoded, ctx) {
        return None;
    }

    let absolute = resolve_against_origin(&decoded, ctx)?;

    if policy.is_url_allowed(&absolute, AllowList::Asset) {
        Some(ctx.asset_url(absolute.as_str()))
    } else {
        Some(absolute.to_string())
    }
}

// fragments, data/javascript/mailto/etc and our own routes
fn is_internal_reference(value: &str, ctx: &RewriteContext) -> bool {
    value.starts_with('#')
        || value.starts_with(&ctx.asset_route)
        || value.starts_with(&ctx.hls_route)
        || value.starts_with("/proxy/")
        || (!value.starts_with("//") && URL_SCHEME.is_match(value))
}

fn resolve_against_origin(value: &str, ctx: &RewriteContext) -> Option<Url> {
    if let Some(rest) = value.strip_prefix("//") {
        return Url::parse(&format!("https://{}", rest)).ok();
    }

    Url::parse(&format!("{}/", ctx.base_origin))
        .and_then(|base| base.join(value))
        .ok()
}

/// what goes at the top of `<head>`: a base tag if the page has none, then the interceptor
pub fn head_injection(html: &str, ctx: &RewriteContext, policy: &DomainPolicy) -> String {
    let script = interceptor_script(ctx, policy);

    if BASE_TAG.is_match(html) {
        script
    } else {
        format!("<base href=\"{}/\">{}", ctx.base_origin, script)
    }
}

/// client side shim that sends fetch/xhr/dynamic script and img loads for allow-listed hosts
/// through the proxy
pub fn interceptor_script(ctx: &RewriteContext, policy: &DomainPolicy) -> String {
    INTERCEPTOR_TEMPLATE
        .replace("__PROXY_DOMAINS__", &to_js_literal(policy.patterns(AllowList::Asset)))
        .replace("__ASSET_ROUTE__", &to_js_literal(&ctx.asset_route))
        .replace("__HLS_ROUTE__", &to_js_literal(&ctx.hls_route))
}

fn to_js_literal<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "null".to_string())
        .replace("</", "<\\/")
}
