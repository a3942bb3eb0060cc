pub mod compression_utils;
pub mod content_type_utils;
pub mod domain_policy_utils;
pub mod html_rewrite_utils;
pub mod m3u8_rewrite_utils;
pub mod proxy_url_utils;
pub mod tls_utils;
