#[derive(clap::ValueEnum, Clone, Debug, Copy)]
pub enum CargoEnv {
    Development,
    Production,
}

#[derive(clap::Parser, Clone, Debug)]
pub struct AppConfig {
    // production or development
    #[clap(long, env, value_enum)]
    pub cargo_env: CargoEnv,

    // port that the app will bind to
    #[clap(long, env, default_value = "5000")]
    pub port: u16,

    // optional sentry integration
    #[clap(long, env)]
    pub sentry_dsn: Option<String>,

    // our own origin, sent upstream as Referer/Origin when the caller doesn't give us one
    #[clap(long, env, default_value = "http://localhost:5000")]
    pub public_origin: String,

    // json DoH endpoint, queried as ?name=<host>&type=A. keep it an IP literal or the system
    // resolver ends up in the loop again
    #[clap(long, env, default_value = "https://1.1.1.1/dns-query")]
    pub doh_endpoint: String,

    #[clap(long, env, default_value = "5")]
    pub dns_timeout_secs: u64,

    // floor for answer TTLs so a 0s TTL doesn't make us query on every request
    #[clap(long, env, default_value = "60")]
    pub dns_min_ttl_secs: u64,

    #[clap(long, env, default_value = "15")]
    pub fetch_timeout_secs: u64,

    #[clap(long, env, default_value = "5")]
    pub max_redirects: usize,

    // pages that may be fetched and rewritten as top level documents
    #[clap(
        long,
        env,
        value_delimiter = ',',
        default_value = "superflixapi.run,superflixapi.buzz,superflixapi.top,embedtv.best,www1.embedtv.best"
    )]
    pub embed_domains: Vec<String>,

    // assets and streams that get routed back through us once found in a page or playlist
    #[clap(
        long,
        env,
        value_delimiter = ',',
        default_value = "superflixapi.run,superflixapi.buzz,superflixapi.top,embedtv.best,www1.embedtv.best,cdn.superflixapi.run,stream.superflixapi.run,cdn.jsdelivr.net,cdnjs.cloudflare.com,unpkg.com"
    )]
    pub asset_domains: Vec<String>,

    // hosts the plain /proxy route may reach through the normal system resolver
    #[clap(
        long,
        env,
        value_delimiter = ',',
        default_value = "superflixapi.run,superflixapi.top,embedtv.best,www1.embedtv.best,image.tmdb.org"
    )]
    pub direct_domains: Vec<String>,

    // we connect to an address we resolved ourselves, so a cert that doesn't list the hostname is
    // accepted for allow-listed hosts as long as the chain and expiry check out
    #[clap(long, env, default_value_t = true, action = clap::ArgAction::Set)]
    pub tolerate_cert_name_mismatch: bool,

    #[clap(long, env, default_value = "1024")]
    pub max_concurrent_requests: usize,
}

impl AppConfig {
    pub fn default_referer(&self) -> String {
        format!("{}/", self.public_origin.trim_end_matches('/'))
    }
}

impl Default for AppConfig {
    // mirrors the clap defaults, mostly so tests can build services without a command line
    fn default() -> Self {
        let split = |s: &str| s.split(',').map(|d| d.to_string()).collect::<Vec<_>>();

        Self {
            cargo_env: CargoEnv::Development,
            port: 5000,
            sentry_dsn: None,
            public_origin: "http://localhost:5000".to_string(),
            doh_endpoint: "https://1.1.1.1/dns-query".to_string(),
            dns_timeout_secs: 5,
            dns_min_ttl_secs: 60,
            fetch_timeout_secs: 15,
            max_redirects: 5,
            embed_domains: split(
                "superflixapi.run,superflixapi.buzz,superflixapi.top,embedtv.best,www1.embedtv.best",
            ),
            asset_domains: split(
                "superflixapi.run,superflixapi.buzz,superflixapi.top,embedtv.best,www1.embedtv.best,cdn.superflixapi.run,stream.superflixapi.run,cdn.jsdelivr.net,cdnjs.cloudflare.com,unpkg.com",
            ),
            direct_domains: split(
                "superflixapi.run,superflixapi.top,embedtv.best,www1.embedtv.best,image.tmdb.org",
            ),
            tolerate_cert_name_mismatch: true,
            max_concurrent_requests: 1024,
        }
    }
}
