pub mod dns_services;
pub mod fetch_services;
pub mod proxy_services;
pub mod redirect_services;

pub use dns_services::{DynClock, DynDnsService, DynDohTransport};
pub use fetch_services::DynPinnedFetchService;
pub use proxy_services::ProxyServices;
