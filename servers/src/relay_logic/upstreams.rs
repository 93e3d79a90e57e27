use anyhow::{Context, Result};
use lib_common::connections::{KeyValueCache, PostgresProbe, mask_url_password};
use lib_common::core::{HttpTokenExchange, Upstreams, WsConnector};
use std::sync::Arc;
use std::time::Duration;

use crate::relay_logic::config::Config;

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .with_context(|| format!("missing required setting: {}", name))
}

/// Builds the concrete upstream adapters from the loaded configuration.
pub async fn connect(config: &Config) -> Result<Upstreams> {
    let database_url = required(&config.database_url, "databaseUrl")?;
    log::info!("Using database: {}", mask_url_password(database_url));
    // Lazy: an unreachable database is reported by the health monitor instead of aborting startup.
    let database = PostgresProbe::new(database_url, config.database_max_connections.unwrap_or(5))
        .context("invalid database URL")?;

    let token_url = required(&config.token_url, "tokenUrl")?;
    let token_exchange = HttpTokenExchange::new(
        token_url,
        required(&config.client_id, "clientId")?,
        required(&config.client_secret, "clientSecret")?,
        Duration::from_secs(config.http_timeout_secs.unwrap_or(10)),
    )
    .context("invalid token endpoint")?;

    let mut connector = WsConnector::new(required(&config.stream_url, "streamUrl")?);
    if let (Some(username), Some(password)) = (&config.stream_username, &config.stream_password) {
        connector = connector.with_basic_auth(username.as_str(), password.as_str());
    }

    Ok(Upstreams {
        database: Arc::new(database),
        token_exchange: Arc::new(token_exchange),
        stream_connector: Arc::new(connector),
        cache: connect_cache(config.redis_url.as_deref()).await,
    })
}

/// The cache is optional; failing to reach it only disables it.
async fn connect_cache(redis_url: Option<&str>) -> Option<Arc<dyn KeyValueCache>> {
    let url = redis_url.filter(|u| !u.is_empty())?;
    match lib_common::connections::RedisCache::connect(url).await {
        Ok(cache) => {
            log::info!("Publishing health states to {}", mask_url_password(url));
            Some(Arc::new(cache))
        }
        Err(e) => {
            log::warn!("Redis unavailable, continuing without cache: {}", e);
            None
        }
    }
}
