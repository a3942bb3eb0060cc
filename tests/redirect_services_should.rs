use std::net::Ipv4Addr;
use std::sync::Arc;

use axum::{body::Bytes, http::HeaderMap, http::StatusCode};
use stream_proxy::server::{
    error::Error,
    services::{
        dns_services::MockDnsServiceTrait,
        fetch_services::{FetchBody, FetchOptions, FetchResult, MockPinnedFetchServiceTrait},
        redirect_services::RedirectService,
    },
    utils::domain_policy_utils::{AllowList, DomainPolicy},
};
use url::Url;

const MAX_HOPS: usize = 5;

fn redirect_to(location: &str) -> FetchResult {
    FetchResult {
        status: StatusCode::FOUND,
        headers: HeaderMap::new(),
        body: FetchBody::Binary(Bytes::new()),
        redirect_location: Some(location.to_string()),
    }
}

fn ok(body: &str) -> FetchResult {
    FetchResult {
        status: StatusCode::OK,
        headers: HeaderMap::new(),
        body: FetchBody::Text(body.to_string()),
        redirect_location: None,
    }
}

fn hop_number(url: &Url) -> usize {
    url.path().trim_start_matches("/hop").parse().unwrap()
}

fn dns(times: usize) -> MockDnsServiceTrait {
    let mut dns = MockDnsServiceTrait::new();
    dns.expect_resolve()
        .times(times)
        .returning(|_| Ok(Ipv4Addr::new(203, 0, 113, 7)));
    dns
}

fn walker(dns: MockDnsServiceTrait, fetcher: MockPinnedFetchServiceTrait) -> RedirectService {
    let policy = DomainPolicy::new(
        &["allowed.com"],
        &["allowed.com"],
        &[] as &[&str],
    );

    RedirectService::new(Arc::new(dns), Arc::new(fetcher), Arc::new(policy), MAX_HOPS)
}

// hop N redirects to hop N+1 until `redirects` redirects have been handed out
fn chain(redirects: usize) -> MockPinnedFetchServiceTrait {
    let mut fetcher = MockPinnedFetchServiceTrait::new();
    fetcher
        .expect_fetch()
        .times((redirects + 1).min(MAX_HOPS + 1))
        .returning(move |url, _, _| {
            let n = hop_number(url);
            if n < redirects {
                Ok(redirect_to(&format!("/hop{}", n + 1)))
            } else {
                Ok(ok("#EXTM3U"))
            }
        });
    fetcher
}

#[tokio::test]
async fn test_exactly_max_hops_redirects_succeeds() {
    let walker = walker(dns(MAX_HOPS + 1), chain(MAX_HOPS));
    let start = Url::parse("https://allowed.com/hop0").unwrap();

    let (final_url, result) = walker
        .fetch_following_redirects(&start, AllowList::Asset, &FetchOptions::text(None))
        .await
        .unwrap();

    assert_eq!(result.status, StatusCode::OK);
    assert_eq!(final_url.as_str(), "https://allowed.com/hop5");
}

#[tokio::test]
async fn test_one_redirect_too_many_fails() {
    let walker = walker(dns(MAX_HOPS + 1), chain(MAX_HOPS + 1));
    let start = Url::parse("https://allowed.com/hop0").unwrap();

    let result = walker
        .fetch_following_redirects(&start, AllowList::Asset, &FetchOptions::text(None))
        .await;

    assert!(matches!(result, Err(Error::TooManyRedirects(MAX_HOPS))));
}

#[tokio::test]
async fn test_redirect_off_the_allow_list_is_refused() {
    let mut fetcher = MockPinnedFetchServiceTrait::new();
    fetcher
        .expect_fetch()
        .times(1)
        .returning(|_, _, _| Ok(redirect_to("https://evil.example/steal")));

    let walker = walker(dns(1), fetcher);
    let start = Url::parse("https://allowed.com/live.m3u8").unwrap();

    let result = walker
        .fetch_following_redirects(&start, AllowList::Asset, &FetchOptions::text(None))
        .await;

    assert!(matches!(result, Err(Error::PolicyViolation(_))));
}

#[tokio::test]
async fn test_disallowed_start_does_no_io() {
    let mut dns = MockDnsServiceTrait::new();
    dns.expect_resolve().never();
    let mut fetcher = MockPinnedFetchServiceTrait::new();
    fetcher.expect_fetch().never();

    let walker = walker(dns, fetcher);
    let start = Url::parse("https://notallowed.com/live.m3u8").unwrap();

    let result = walker
        .fetch_following_redirects(&start, AllowList::Asset, &FetchOptions::text(None))
        .await;

    assert!(matches!(result, Err(Error::PolicyViolation(_))));
}

#[tokio::test]
async fn test_dns_failure_aborts_the_walk() {
    let mut dns = MockDnsServiceTrait::new();
    dns.expect_resolve()
        .times(1)
        .returning(|host| Err(Error::DnsFailure(host.to_string())));
    let mut fetcher = MockPinnedFetchServiceTrait::new();
    fetcher.expect_fetch().never();

    let walker = walker(dns, fetcher);
    let start = Url::parse("https://cdn.allowed.com/a.ts").unwrap();

    let result = walker
        .fetch_following_redirects(&start, AllowList::Asset, &FetchOptions::binary(None))
        .await;

    assert!(matches!(result, Err(Error::DnsFailure(_))));
}

#[tokio::test]
async fn test_relative_locations_resolve_against_the_current_hop() {
    let mut fetcher = MockPinnedFetchServiceTrait::new();
    fetcher
        .expect_fetch()
        .times(2)
        .returning(|url, _, _| match url.path() {
            "/a/live.m3u8" => Ok(redirect_to("../b/live2.m3u8")),
            _ => Ok(ok("#EXTM3U")),
        });

    let walker = walker(dns(2), fetcher);
    let start = Url::parse("https://allowed.com/a/live.m3u8").unwrap();

    let (final_url, _) = walker
        .fetch_following_redirects(&start, AllowList::Asset, &FetchOptions::text(None))
        .await
        .unwrap();

    assert_eq!(final_url.as_str(), "https://allowed.com/b/live2.m3u8");
}

#[tokio::test]
async fn test_fetch_once_returns_redirects_unfollowed() {
    let mut fetcher = MockPinnedFetchServiceTrait::new();
    fetcher
        .expect_fetch()
        .times(1)
        .returning(|_, _, _| Ok(redirect_to("/elsewhere.png")));

    let walker = walker(dns(1), fetcher);
    let start = Url::parse("https://allowed.com/a.png").unwrap();

    let result = walker
        .fetch_once(&start, AllowList::Asset, &FetchOptions::binary(None))
        .await
        .unwrap();

    assert!(result.is_redirect());
    assert_eq!(result.redirect_location.as_deref(), Some("/elsewhere.png"));
}
