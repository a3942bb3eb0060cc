use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{debug, error};
use url::Url;

use crate::server::utils::{
    content_type_utils::is_segment_url,
    domain_policy_utils::{AllowList, DomainPolicy},
    proxy_url_utils::RewriteContext,
};

static URI_ATTRIBUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"URI="([^"]+)""#).expect("URI attribute regex should compile"));

/// rewrite every uri in a playlist so the player comes back through us
///
/// tag lines only change inside `URI="..."` (keys, maps, media renditions) and those always go to
/// the hls route. plain lines are segments or nested playlists: `.ts` goes to the asset route,
/// everything else to the hls route. hosts that aren't allow-listed get their absolute url so the
/// player doesn't resolve them against our origin
pub fn rewrite_m3u8(
    body: &str,
    source_url: &Url,
    ctx: &RewriteContext,
    policy: &DomainPolicy,
) -> String {
    body.split('\n')
        .map(|raw| {
            let (line, cr) = match raw.strip_suffix('\r') {
                Some(line) => (line, "\r"),
                None => (raw, ""),
            };
            let trimmed = line.trim();

            if trimmed.is_empty() {
                return raw.to_string();
            }

            if trimmed.starts_with('#') {
                if !trimmed.contains("URI=\"") {
                    return raw.to_string();
                }
                let rewritten = URI_ATTRIBUTE.replace_all(line, |caps: &Captures| {
                    let uri = &caps[1];
                    match resolve(source_url, uri) {
                        Some(absolute) if policy.is_url_allowed(&absolute, AllowList::Asset) => {
                            format!("URI=\"{}\"", ctx.hls_url(absolute.as_str()))
                        }
                        Some(absolute) => format!("URI=\"{}\"", absolute),
                        None => caps[0].to_string(),
                    }
                });
                return format!("{}{}", rewritten, cr);
            }

            let Some(absolute) = resolve(source_url, trimmed) else {
                return raw.to_string();
            };

            if !policy.is_url_allowed(&absolute, AllowList::Asset) {
                debug!("Leaving non allow-listed playlist entry as is: {}", absolute);
                return format!("{}{}", absolute, cr);
            }

            let proxied = if is_segment_url(&absolute) {
                ctx.asset_url(absolute.as_str())
            } else {
                ctx.hls_url(absolute.as_str())
            };

            format!("{}{}", proxied, cr)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn resolve(source_url: &Url, reference: &str) -> Option<Url> {
    match source_url.join(reference) {
        Ok(resolved) => Some(resolved),
        Err(e) => {
            error!("Failed to resolve: {} - {}", reference, e);
            None
        }
    }
}
