use clap::Parser;
use lib_common::configs::{HealthConfig, RelayConfig, StreamConfig, TokenConfig, TrackerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Connection-resilient event relay server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "RELAY_PORT", help = "Port to listen on for downstream subscribers.")]
    pub port: Option<u16>,

    #[clap(long, env = "RELAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "DATABASE_URL", hide_env_values = true, help = "PostgreSQL connection URL.")]
    pub database_url: Option<String>,

    #[clap(long, env = "RELAY_DATABASE_MAX_CONNECTIONS", help = "Size of the database pool.")]
    pub database_max_connections: Option<u32>,

    #[clap(long, env = "RELAY_TOKEN_URL", help = "OAuth2 token endpoint of the REST upstream.")]
    pub token_url: Option<String>,

    #[clap(long, env = "RELAY_CLIENT_ID", help = "OAuth2 client id.")]
    pub client_id: Option<String>,

    #[clap(long, env = "RELAY_CLIENT_SECRET", hide_env_values = true, help = "OAuth2 client secret.")]
    pub client_secret: Option<String>,

    #[clap(long, env = "RELAY_HTTP_TIMEOUT_SECS", help = "Timeout in seconds for token endpoint requests.")]
    pub http_timeout_secs: Option<u64>,

    #[clap(long, env = "RELAY_STREAM_URL", help = "Upstream event stream WebSocket URL.")]
    pub stream_url: Option<String>,

    #[clap(long, env = "RELAY_STREAM_USERNAME", help = "Username for the stream handshake.")]
    pub stream_username: Option<String>,

    #[clap(long, env = "RELAY_STREAM_PASSWORD", hide_env_values = true, help = "Password for the stream handshake.")]
    pub stream_password: Option<String>,

    #[clap(long, env = "RELAY_RECONNECT_BASE_DELAY_MS", help = "Delay in milliseconds before the first stream reconnect.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "RELAY_RECONNECT_GROWTH_FACTOR", help = "Backoff multiplier between consecutive reconnects.")]
    pub reconnect_growth_factor: Option<f64>,

    #[clap(long, env = "RELAY_RECONNECT_MAX_ATTEMPTS", help = "Consecutive reconnects before the stream gives up.")]
    pub reconnect_max_attempts: Option<u32>,

    #[clap(long, env = "RELAY_HEALTH_CHECK_INTERVAL_MS", help = "Interval in milliseconds between health check cycles.")]
    pub health_check_interval_ms: Option<u64>,

    #[clap(long, env = "RELAY_HEALTH_CHECK_TIMEOUT_MS", help = "Upper bound in milliseconds for a single health check.")]
    pub health_check_timeout_ms: Option<u64>,

    #[clap(long, env = "RELAY_ERROR_CAPACITY", help = "Number of diagnostic events kept in memory.")]
    pub error_capacity: Option<usize>,

    #[clap(long, env = "REDIS_URL", hide_env_values = true, help = "Optional Redis URL for publishing health states.")]
    pub redis_url: Option<String>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            database_url: other.database_url.or(self.database_url),
            database_max_connections: other.database_max_connections.or(self.database_max_connections),
            token_url: other.token_url.or(self.token_url),
            client_id: other.client_id.or(self.client_id),
            client_secret: other.client_secret.or(self.client_secret),
            http_timeout_secs: other.http_timeout_secs.or(self.http_timeout_secs),
            stream_url: other.stream_url.or(self.stream_url),
            stream_username: other.stream_username.or(self.stream_username),
            stream_password: other.stream_password.or(self.stream_password),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_growth_factor: other.reconnect_growth_factor.or(self.reconnect_growth_factor),
            reconnect_max_attempts: other.reconnect_max_attempts.or(self.reconnect_max_attempts),
            health_check_interval_ms: other.health_check_interval_ms.or(self.health_check_interval_ms),
            health_check_timeout_ms: other.health_check_timeout_ms.or(self.health_check_timeout_ms),
            error_capacity: other.error_capacity.or(self.error_capacity),
            redis_url: other.redis_url.or(self.redis_url),
        }
    }

    /// Engine settings; anything not configured keeps the engine default.
    pub fn relay_config(&self) -> RelayConfig {
        let token = TokenConfig::default();
        let stream = StreamConfig::default();
        let health = HealthConfig::default();
        let tracker = TrackerConfig::default();
        RelayConfig {
            token,
            stream: StreamConfig {
                reconnect_base_delay_ms: self.reconnect_base_delay_ms.unwrap_or(stream.reconnect_base_delay_ms),
                reconnect_growth_factor: self.reconnect_growth_factor.unwrap_or(stream.reconnect_growth_factor),
                reconnect_max_attempts: self.reconnect_max_attempts.unwrap_or(stream.reconnect_max_attempts),
                ..stream
            },
            health: HealthConfig {
                check_interval_ms: self.health_check_interval_ms.unwrap_or(health.check_interval_ms),
                check_timeout_ms: self.health_check_timeout_ms.unwrap_or(health.check_timeout_ms),
                ..health
            },
            tracker: TrackerConfig {
                capacity: self.error_capacity.unwrap_or(tracker.capacity),
                ..tracker
            },
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

fn default_config() -> Config {
    Config {
        port: Some(9003),
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        database_max_connections: Some(5),
        http_timeout_secs: Some(10),
        reconnect_base_delay_ms: Some(5000),
        reconnect_growth_factor: Some(1.5),
        reconnect_max_attempts: Some(10),
        health_check_interval_ms: Some(5000),
        health_check_timeout_ms: Some(5000),
        error_capacity: Some(1000),
        ..Default::default()
    }
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Defaults, then the JSON file, then environment variables and CLI flags.
fn resolve(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_relay.conf"));

    let mut current_config = default_config();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli)
}

pub fn load_config() -> Config {
    // clap::Parser handles both env vars and CLI args.
    resolve(Config::parse())
}
