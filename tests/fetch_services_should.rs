mod common;

use std::io::Write;
use std::net::Ipv4Addr;
use std::time::Duration;

use flate2::{Compression, write::GzEncoder};
use reqwest::{StatusCode, header};
use stream_proxy::server::{
    error::Error,
    services::fetch_services::{
        BROWSER_USER_AGENT, FetchBody, FetchOptions, PinnedFetchService, PinnedFetchServiceTrait,
    },
};
use url::Url;

use common::{closed_port, http_response, spawn_upstream};

const PAGE: &str = "<html><body>pinned</body></html>";
const SEGMENT: [u8; 6] = [0x47, 0x40, 0x00, 0x10, 0x00, 0xff];

fn fetcher() -> PinnedFetchService {
    PinnedFetchService::new(Duration::from_secs(5), "http://localhost:5000/", true).unwrap()
}

// the hostname never resolves anywhere, the only way to reach the listener is the pin
fn pinned_url(host: &str, port: u16, path: &str) -> Url {
    Url::parse(&format!("http://{}:{}{}", host, port, path)).unwrap()
}

fn gzip(payload: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload).unwrap();
    encoder.finish().unwrap()
}

#[tokio::test]
async fn test_text_fetch_goes_to_the_pinned_ip_with_browser_headers() {
    let mut upstream = spawn_upstream(|_| {
        http_response(
            "200 OK",
            &[
                ("content-type", "text/html; charset=utf-8"),
                ("content-encoding", "gzip"),
            ],
            &gzip(PAGE.as_bytes()),
        )
    })
    .await;

    let url = pinned_url("pinned.example", upstream.port, "/embed/1");
    let result = fetcher()
        .fetch(&url, Ipv4Addr::LOCALHOST, &FetchOptions::text(None))
        .await
        .unwrap();

    let seen = upstream.requests.recv().await.unwrap();
    assert_eq!(seen.request_line, "GET /embed/1 HTTP/1.1");
    assert_eq!(
        seen.header("host"),
        Some(format!("pinned.example:{}", upstream.port).as_str())
    );
    assert_eq!(seen.header("user-agent"), Some(BROWSER_USER_AGENT));
    assert_eq!(seen.header("accept-encoding"), Some("gzip, deflate, br, zstd"));
    assert_eq!(seen.header("accept-language"), Some("en-US,en;q=0.9"));
    assert_eq!(seen.header("sec-fetch-dest"), Some("iframe"));
    assert_eq!(seen.header("sec-fetch-mode"), Some("navigate"));
    assert_eq!(seen.header("sec-fetch-site"), Some("cross-site"));
    assert_eq!(seen.header("sec-fetch-user"), Some("?1"));
    // no caller referer, so our own origin stands in
    assert_eq!(seen.header("referer"), Some("http://localhost:5000/"));
    assert_eq!(seen.header("origin"), Some("http://localhost:5000"));

    assert_eq!(result.status, StatusCode::OK);
    assert!(result.redirect_location.is_none());
    assert!(result.headers.get(header::CONTENT_ENCODING).is_none());
    assert!(result.headers.get(header::CONTENT_LENGTH).is_none());
    assert_eq!(
        result.headers.get(header::CONTENT_TYPE).unwrap(),
        "text/html; charset=utf-8"
    );
    match result.body {
        FetchBody::Text(text) => assert_eq!(text, PAGE),
        other => panic!("expected a text body, got {:?}", other),
    }
}

#[tokio::test]
async fn test_binary_fetch_asks_for_identity_and_keeps_raw_bytes() {
    let mut upstream = spawn_upstream(|_| {
        http_response("200 OK", &[("content-type", "video/mp2t")], &SEGMENT)
    })
    .await;

    let url = pinned_url("pinned.example", upstream.port, "/seg/0001.ts");
    let options = FetchOptions::binary(Some("https://site.example/watch/1".to_string()));
    let result = fetcher()
        .fetch(&url, Ipv4Addr::LOCALHOST, &options)
        .await
        .unwrap();

    let seen = upstream.requests.recv().await.unwrap();
    assert_eq!(seen.path(), "/seg/0001.ts");
    assert_eq!(seen.header("accept-encoding"), Some("identity"));
    assert_eq!(seen.header("accept"), Some("*/*"));
    assert_eq!(seen.header("referer"), Some("https://site.example/watch/1"));
    assert_eq!(seen.header("origin"), Some("https://site.example"));

    assert_eq!(result.status, StatusCode::OK);
    assert_eq!(result.headers.get(header::CONTENT_LENGTH).unwrap(), "6");
    match result.body {
        FetchBody::Binary(bytes) => assert_eq!(&bytes[..], &SEGMENT[..]),
        other => panic!("expected a binary body, got {:?}", other),
    }
}

#[tokio::test]
async fn test_location_is_only_reported_for_redirects() {
    let upstream = spawn_upstream(|request| match request.path() {
        "/moved" => http_response("302 Found", &[("location", "/next.m3u8")], b""),
        _ => http_response("200 OK", &[("location", "/ignored")], b"#EXTM3U\n"),
    })
    .await;
    let fetcher = fetcher();

    let moved = fetcher
        .fetch(
            &pinned_url("pinned.example", upstream.port, "/moved"),
            Ipv4Addr::LOCALHOST,
            &FetchOptions::text(None),
        )
        .await
        .unwrap();
    assert_eq!(moved.status, StatusCode::FOUND);
    assert_eq!(moved.redirect_location.as_deref(), Some("/next.m3u8"));
    assert!(moved.is_redirect());

    let ok = fetcher
        .fetch(
            &pinned_url("pinned.example", upstream.port, "/live.m3u8"),
            Ipv4Addr::LOCALHOST,
            &FetchOptions::text(None),
        )
        .await
        .unwrap();
    assert_eq!(ok.status, StatusCode::OK);
    assert!(ok.redirect_location.is_none());
    assert!(!ok.is_redirect());
}

#[tokio::test]
async fn test_clients_are_reused_per_host_and_address() {
    let upstream = spawn_upstream(|_| http_response("200 OK", &[], &SEGMENT)).await;
    let fetcher = fetcher();
    let options = FetchOptions::binary(None);

    for path in ["/seg/1.ts", "/seg/2.ts", "/seg/3.ts"] {
        fetcher
            .fetch(
                &pinned_url("pinned.example", upstream.port, path),
                Ipv4Addr::LOCALHOST,
                &options,
            )
            .await
            .unwrap();
    }
    assert_eq!(fetcher.cached_clients(), 1);

    fetcher
        .fetch(
            &pinned_url("other.example", upstream.port, "/seg/1.ts"),
            Ipv4Addr::LOCALHOST,
            &options,
        )
        .await
        .unwrap();
    assert_eq!(fetcher.cached_clients(), 2);
}

#[tokio::test]
async fn test_unreachable_pin_is_a_fetch_failure() {
    let port = closed_port().await;

    let result = fetcher()
        .fetch(
            &pinned_url("pinned.example", port, "/"),
            Ipv4Addr::LOCALHOST,
            &FetchOptions::text(None),
        )
        .await;

    assert!(matches!(result, Err(Error::FetchFailure(_))));
}
