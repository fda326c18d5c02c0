use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub reconciler: ReconcilerConfig,
    pub cache: CacheConfig,
}

impl ApiConfig {
    pub fn load() -> Result<Self> {
        let configured_path =
            std::env::var("POLLBOX_API_CONFIG").unwrap_or_else(|_| "config/api.toml".to_string());
        assert!(
            !configured_path.is_empty(),
            "Configuration path must be non-empty"
        );
        assert!(
            configured_path.len() < 4096,
            "Configuration path length exceeds hard limit"
        );

        let mut builder = Config::builder()
            .add_source(File::new(&configured_path, FileFormat::Toml).required(true));

        if let Ok(env_override) = std::env::var("POLLBOX_API_ENV") {
            if !env_override.is_empty() {
                let env_file = format!("config/api.{}.toml", env_override);
                if Path::new(&env_file).exists() {
                    builder = builder.add_source(File::new(&env_file, FileFormat::Toml));
                }
            }
        }

        let settings = builder
            .build()
            .map_err(|err| map_config_error(err, &configured_path))?;
        let config: Self = settings
            .try_deserialize()
            .context("Failed to deserialize API configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        assert!(
            !self.database.url.is_empty(),
            "Database URL must be specified"
        );
        assert!(
            self.server.port > 0,
            "Server port must be greater than zero"
        );
        self.reconciler.ensure_bounds()?;
        self.cache.ensure_bounds()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Option<IpAddr>,
    pub port: u16,
}

impl ServerConfig {
    pub fn address(&self) -> SocketAddr {
        let host = self.host.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(self.port != 0, "HTTP port cannot be zero");
        assert!(self.port < 65535, "HTTP port must be below 65535");
        SocketAddr::new(host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    /// How often the status reconciler sweeps every poll. The original
    /// deployment refreshed every five minutes.
    #[serde(default = "ReconcilerConfig::default_interval_ms")]
    pub interval_ms: u64,
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        assert!(
            self.interval_ms >= 1_000,
            "Reconciler interval must be >= 1 second"
        );
        assert!(
            self.interval_ms <= 3_600_000,
            "Reconciler interval must be <= 1 hour"
        );
        Duration::from_millis(self.interval_ms)
    }

    pub fn ensure_bounds(&self) -> Result<()> {
        assert!(
            self.interval_ms >= 1_000,
            "Reconciler interval below 1 second"
        );
        assert!(
            self.interval_ms <= 3_600_000,
            "Reconciler interval exceeds 1 hour"
        );
        Ok(())
    }

    const fn default_interval_ms() -> u64 {
        300_000
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub results_max_capacity: u64,
    pub results_ttl_seconds: u64,
    pub polls_max_capacity: u64,
    pub polls_ttl_seconds: u64,
}

impl CacheConfig {
    fn ensure_bounds(&self) -> Result<()> {
        assert!(
            self.results_max_capacity >= 10,
            "Results cache capacity must be at least 10"
        );
        assert!(
            self.results_ttl_seconds <= 3_600,
            "Results cache TTL cannot exceed one hour"
        );
        assert!(
            self.polls_max_capacity >= 10,
            "Poll list cache capacity must be at least 10"
        );
        assert!(
            self.polls_ttl_seconds <= 3_600,
            "Poll list cache TTL cannot exceed one hour"
        );
        Ok(())
    }
}

fn map_config_error(err: ConfigError, path: &str) -> ConfigError {
    match err {
        ConfigError::NotFound(_) => ConfigError::NotFound(path.to_string()),
        other => other,
    }
}
