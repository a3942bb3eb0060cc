use axum::http::{HeaderMap, header};
use url::Url;

pub const M3U8_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
pub const MPEG_TS_CONTENT_TYPE: &str = "video/mp2t";
pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// best guess from the path suffix, used when upstream doesn't send a content-type
pub fn infer_from_path(path: &str) -> &'static str {
    let path = path.to_ascii_lowercase();
    let ext = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");

    match ext {
        "js" | "mjs" => "application/javascript",
        "css" => "text/css",
        "m3u8" => M3U8_CONTENT_TYPE,
        "ts" => MPEG_TS_CONTENT_TYPE,
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

/// upstream content-type if present, otherwise whatever the path looks like
pub fn resolve_content_type(headers: &HeaderMap, url: &Url) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| infer_from_path(url.path()).to_string())
}

pub fn is_playlist_url(url: &Url) -> bool {
    url.path().to_ascii_lowercase().ends_with(".m3u8")
}

pub fn is_segment_url(url: &Url) -> bool {
    url.path().to_ascii_lowercase().ends_with(".ts")
}

pub fn is_playlist_content_type(content_type: &str) -> bool {
    let content_type = content_type.to_ascii_lowercase();
    content_type.contains("mpegurl") || content_type.contains("m3u8")
}

/// playlist if the url says so, the content-type says so, or the body starts like one
pub fn looks_like_playlist(url: &Url, headers: &HeaderMap, body: &[u8]) -> bool {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    // some origins prefix the playlist with a BOM
    let body = body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body);

    is_playlist_url(url) || is_playlist_content_type(content_type) || body.starts_with(b"#EXTM3U")
}
