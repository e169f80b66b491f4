use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono_tz::Tz;
use config::{Config, ConfigError, File, FileFormat};
use croner::Cron;
use serde::Deserialize;

pub const SERVER_KEY_ENV: &str = "PORTAL_SERVER_KEY";

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub email: EmailConfig,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
}

impl ApiConfig {
    pub fn load() -> Result<Self> {
        let configured_path =
            std::env::var("PORTAL_API_CONFIG").unwrap_or_else(|_| "config/api.toml".to_string());
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

        if let Ok(env_override) = std::env::var("PORTAL_API_ENV") {
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
        let mut config: Self = settings
            .try_deserialize()
            .context("Failed to deserialize API configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(anyhow!("Database URL must be specified"));
        }
        if self.server.port == 0 {
            return Err(anyhow!("Server port must be greater than zero"));
        }
        assert!(
            self.database.max_connections >= self.database.min_connections.unwrap_or(1),
            "Max connections must be >= min connections"
        );
        self.auth.ensure_bounds()?;
        self.email.ensure_bounds()?;
        self.scheduler.ensure_bounds()?;
        self.cache.ensure_bounds()?;
        Ok(())
    }
}

/// Shared secret for server-to-server calls. Never read from the config file.
pub fn server_key_from_env() -> Option<String> {
    std::env::var(SERVER_KEY_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
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
pub struct AuthConfig {
    pub token_secret: String,
    pub token_issuer: String,
    #[serde(default = "AuthConfig::default_token_ttl_seconds")]
    pub token_ttl_seconds: i64,
    #[serde(default = "AuthConfig::default_session_ttl_seconds")]
    pub session_ttl_seconds: i64,
    #[serde(default = "AuthConfig::default_session_cookie_name")]
    pub session_cookie_name: String,
}

impl AuthConfig {
    fn ensure_bounds(&self) -> Result<()> {
        if self.token_secret.len() < 32 {
            return Err(anyhow!("auth.token_secret must be at least 32 bytes"));
        }
        if self.token_issuer.trim().is_empty() {
            return Err(anyhow!("auth.token_issuer must not be empty"));
        }
        assert!(self.token_ttl_seconds > 0, "Token TTL must be positive");
        assert!(
            self.session_ttl_seconds <= 14 * 86_400,
            "Session TTL cannot exceed two weeks"
        );
        assert!(
            !self.session_cookie_name.is_empty(),
            "Session cookie name must be set"
        );
        Ok(())
    }

    const fn default_token_ttl_seconds() -> i64 {
        3_600
    }

    const fn default_session_ttl_seconds() -> i64 {
        5 * 86_400
    }

    fn default_session_cookie_name() -> String {
        "__session".to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from_address: String,
    pub request_timeout_ms: Option<u64>,
    #[serde(default = "EmailConfig::default_daily_recipient_limit")]
    pub daily_recipient_limit: u32,
    #[serde(default = "EmailConfig::default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub admin_recipients: Vec<String>,
}

impl EmailConfig {
    pub fn request_timeout(&self) -> Duration {
        let millis = self.request_timeout_ms.unwrap_or(10_000);
        assert!(millis >= 100, "Email API timeout must be at least 100ms");
        assert!(millis <= 60_000, "Email API timeout cannot exceed 60 seconds");
        Duration::from_millis(millis)
    }

    fn ensure_bounds(&self) -> Result<()> {
        if self.api_url.trim().is_empty() {
            return Err(anyhow!("email.api_url must be specified"));
        }
        if self.from_address.trim().is_empty() {
            return Err(anyhow!("email.from_address must be specified"));
        }
        assert!(self.batch_size > 0, "Email batch size must be positive");
        assert!(
            self.daily_recipient_limit > 0,
            "Daily recipient limit must be positive"
        );
        assert!(
            self.batch_size <= self.daily_recipient_limit as usize,
            "Email batch size cannot exceed the daily recipient limit"
        );
        Ok(())
    }

    const fn default_daily_recipient_limit() -> u32 {
        100
    }

    const fn default_batch_size() -> usize {
        50
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "SchedulerConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "SchedulerConfig::default_timezone")]
    pub timezone: String,
    #[serde(default = "SchedulerConfig::default_booking_reminder_cron")]
    pub booking_reminder_cron: String,
    #[serde(default = "SchedulerConfig::default_usage_summary_cron")]
    pub usage_summary_cron: String,
}

impl SchedulerConfig {
    pub fn timezone(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|err| anyhow!("Unknown scheduler timezone {}: {err}", self.timezone))
    }

    pub fn booking_reminder(&self) -> Result<Cron> {
        parse_cron("booking_reminder_cron", &self.booking_reminder_cron)
    }

    pub fn usage_summary(&self) -> Result<Cron> {
        parse_cron("usage_summary_cron", &self.usage_summary_cron)
    }

    fn ensure_bounds(&self) -> Result<()> {
        self.timezone()?;
        self.booking_reminder()?;
        self.usage_summary()?;
        Ok(())
    }

    const fn default_enabled() -> bool {
        true
    }

    fn default_timezone() -> String {
        "Europe/London".to_string()
    }

    fn default_booking_reminder_cron() -> String {
        "0 7 * * *".to_string()
    }

    fn default_usage_summary_cron() -> String {
        "0 6 1 * *".to_string()
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            timezone: Self::default_timezone(),
            booking_reminder_cron: Self::default_booking_reminder_cron(),
            usage_summary_cron: Self::default_usage_summary_cron(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub questions_max_capacity: u64,
    pub questions_ttl_seconds: u64,
}

impl CacheConfig {
    fn ensure_bounds(&self) -> Result<()> {
        assert!(
            self.questions_max_capacity >= 10,
            "Question cache capacity must be at least 10"
        );
        assert!(
            self.questions_ttl_seconds <= 86_400,
            "Question cache TTL cannot exceed one day"
        );
        Ok(())
    }
}

fn parse_cron(label: &str, expression: &str) -> Result<Cron> {
    expression
        .trim()
        .parse::<Cron>()
        .map_err(|err| anyhow!("Invalid scheduler.{label} '{expression}': {err}"))
}

fn map_config_error(err: ConfigError, path: &str) -> ConfigError {
    match err {
        ConfigError::NotFound(_) => ConfigError::NotFound(path.to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_defaults_parse() {
        let scheduler = SchedulerConfig::default();
        assert!(scheduler.ensure_bounds().is_ok());
        assert_eq!(scheduler.timezone().unwrap(), chrono_tz::Europe::London);
    }

    #[test]
    fn scheduler_rejects_unknown_timezone() {
        let scheduler = SchedulerConfig {
            timezone: "Mars/Olympus".to_string(),
            ..SchedulerConfig::default()
        };
        assert!(scheduler.ensure_bounds().is_err());
    }

    #[test]
    fn scheduler_rejects_bad_cron() {
        let scheduler = SchedulerConfig {
            booking_reminder_cron: "every morning".to_string(),
            ..SchedulerConfig::default()
        };
        assert!(scheduler.booking_reminder().is_err());
    }

    #[test]
    fn sample_config_loads_and_validates() {
        let mut config: ApiConfig = Config::builder()
            .add_source(File::from_str(
                include_str!("../../config/api.toml"),
                FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        config.validate().unwrap();
        assert_eq!(config.email.daily_recipient_limit, 100);
        assert_eq!(config.email.batch_size, 50);
        assert_eq!(config.server.address().port(), 8080);
    }

    #[test]
    fn short_token_secret_is_rejected() {
        let auth = AuthConfig {
            token_secret: "too-short".to_string(),
            token_issuer: "portal".to_string(),
            token_ttl_seconds: 3_600,
            session_ttl_seconds: 86_400,
            session_cookie_name: "__session".to_string(),
        };
        assert!(auth.ensure_bounds().is_err());
    }
}
