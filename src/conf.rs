use figment::{
    providers::{Env, Format, Toml},
    Figment, Profile,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::path::PathBuf;

use crate::token::expiry_deadline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenBackend {
    Sqlite,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// directory the downloadable files are served from
    pub root_path: PathBuf,
    pub token_backend: TokenBackend,
    pub database_url: String,
    pub token_file: PathBuf,
    /// base url used to build the links handed out by the issuing endpoint
    pub public_url: String,
    pub default_expires_in_minutes: i64,
    pub cleanup_interval_secs: u64,
    pub retention_hours: i64,
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: i64,
    pub admin_username: String,
    /// scrypt PHC string, admin routes are closed when absent
    pub admin_phc: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            root_path: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            token_backend: TokenBackend::Sqlite,
            database_url: "merchdl.sqlite".to_string(),
            token_file: PathBuf::from("download-tokens.json"),
            public_url: "http://localhost:8000".to_string(),
            default_expires_in_minutes: 60,
            cleanup_interval_secs: 3600,
            retention_hours: 24 * 7,
            rate_limit_requests: 30,
            rate_limit_window_secs: 60,
            admin_username: "admin".to_string(),
            admin_phc: None,
        }
    }
}

pub const ENV_PREFIX: &str = "MERCHDL_";

const MAX_RETENTION_HOURS: i64 = 24 * 365 * 100;
const MAX_RATE_LIMIT_WINDOW_SECS: i64 = 24 * 3600;

impl AppConfig {
    /// The figment the server is launched with: rocket's own sources
    /// (Rocket.toml, ROCKET_*) plus MERCHDL_* overrides.
    pub fn server_figment() -> Figment {
        rocket::Config::figment().merge(Env::prefixed(ENV_PREFIX).global())
    }

    /// Same sources as the server, without rocket, for the admin tooling.
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        let profile = Profile::from_env_or("ROCKET_PROFILE", Profile::Default);
        let figment = Figment::from(Toml::file(path).nested())
            .merge(Env::prefixed(ENV_PREFIX).global())
            .select(profile);
        Self::extract(&figment)
    }

    /// Extract and validate.
    pub fn extract(figment: &Figment) -> Result<Self, figment::Error> {
        let conf: AppConfig = figment.extract()?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<(), figment::Error> {
        if self.default_expires_in_minutes <= 0
            || expiry_deadline(Utc::now(), self.default_expires_in_minutes).is_none()
        {
            return Err(format!(
                "default_expires_in_minutes must be a positive number of minutes, got {}",
                self.default_expires_in_minutes
            )
            .into());
        }
        if !(0..=MAX_RETENTION_HOURS).contains(&self.retention_hours) {
            return Err(format!(
                "retention_hours must be between 0 and {}, got {}",
                MAX_RETENTION_HOURS, self.retention_hours
            )
            .into());
        }
        if !(1..=MAX_RATE_LIMIT_WINDOW_SECS).contains(&self.rate_limit_window_secs) {
            return Err(format!(
                "rate_limit_window_secs must be between 1 and {}, got {}",
                MAX_RATE_LIMIT_WINDOW_SECS, self.rate_limit_window_secs
            )
            .into());
        }
        if self.rate_limit_requests == 0 {
            return Err("rate_limit_requests must be at least 1".into());
        }
        Ok(())
    }

    /// How long expired or completed tokens are kept. Only meaningful on a
    /// validated config.
    pub fn retention(&self) -> Duration {
        Duration::hours(self.retention_hours)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::seconds(self.rate_limit_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::Serialized;

    #[test]
    fn defaults_fill_missing_keys() {
        let conf: AppConfig = Figment::new()
            .merge(Serialized::default("token_backend", "json"))
            .merge(Serialized::default("retention_hours", 1))
            .extract()
            .unwrap();
        assert_eq!(conf.token_backend, TokenBackend::Json);
        assert_eq!(conf.retention_hours, 1);
        assert_eq!(conf.default_expires_in_minutes, 60);
        assert!(conf.admin_phc.is_none());
    }

    #[test]
    fn reads_nested_profile_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Rocket.toml");
        std::fs::write(
            &path,
            "[default]\ntoken_backend = \"json\"\nrate_limit_requests = 5\n",
        )
        .unwrap();
        let conf = AppConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(conf.token_backend, TokenBackend::Json);
        assert_eq!(conf.rate_limit_requests, 5);
    }

    #[test]
    fn rejects_out_of_range_values() {
        for (key, value) in [
            ("retention_hours", -1),
            ("retention_hours", i64::MAX),
            ("rate_limit_window_secs", 0),
            ("rate_limit_window_secs", i64::MAX),
            ("default_expires_in_minutes", 0),
            ("default_expires_in_minutes", i64::MAX),
            ("rate_limit_requests", 0),
        ] {
            let figment = Figment::new().merge(Serialized::default(key, value));
            let err = AppConfig::extract(&figment).unwrap_err();
            assert!(err.to_string().contains(key), "{}: {}", key, err);
        }

        let figment = Figment::new().merge(Serialized::default("retention_hours", 0));
        let conf = AppConfig::extract(&figment).unwrap();
        assert_eq!(conf.retention(), Duration::zero());
    }
}
