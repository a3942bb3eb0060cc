use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;

use tracing::info;

use stream_proxy::{AppConfig, Logger, ProxyApplicationServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = Arc::new(AppConfig::parse());

    // guards are kept alive to flush logs and keep the sentry client around
    let _guards = Logger::init(config.cargo_env, config.sentry_dsn.clone());

    info!(
        "logger and env prepped, {} embed / {} asset / {} direct domains allowed...",
        config.embed_domains.len(),
        config.asset_domains.len(),
        config.direct_domains.len()
    );

    ProxyApplicationServer::serve(config)
        .await
        .context("proxy server failed to start")?;

    Ok(())
}
