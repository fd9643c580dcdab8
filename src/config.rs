use crate::error::{Error, Result};
use crate::services::integrity_monitor::MonitorPolicy;
use crate::services::judge_client::PollPolicy;
use dotenvy::dotenv;
use std::env;
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_address: String,
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub judge_base_url: Url,
    pub judge_api_key: Option<String>,
    pub judge_poll_interval: Duration,
    pub judge_max_poll_attempts: u32,
    pub max_warnings: u32,
    pub max_seconds_out_of_view: u64,
    pub signal_coalesce_window: Duration,
    pub recording_webhook_url: Option<String>,
}

pub static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let store_backend = match env::var("STORE_BACKEND").as_deref() {
            Ok("memory") => StoreBackend::Memory,
            Ok("postgres") | Err(_) => StoreBackend::Postgres,
            Ok(other) => {
                return Err(Error::Config(format!(
                    "Invalid value for STORE_BACKEND: {}",
                    other
                )))
            }
        };
        let database_url = match store_backend {
            StoreBackend::Postgres => Some(get_env("DATABASE_URL")?),
            StoreBackend::Memory => env::var("DATABASE_URL").ok(),
        };

        let judge_base_url = get_env("JUDGE_BASE_URL")?;
        let judge_base_url = Url::parse(&judge_base_url)
            .map_err(|e| Error::Config(format!("Invalid value for JUDGE_BASE_URL: {}", e)))?;

        Ok(Self {
            server_address: get_env_or("SERVER_ADDRESS", "0.0.0.0:8080".to_string())?,
            store_backend,
            database_url,
            judge_base_url,
            judge_api_key: env::var("JUDGE_API_KEY").ok().filter(|k| !k.is_empty()),
            judge_poll_interval: Duration::from_millis(get_env_or("JUDGE_POLL_INTERVAL_MS", 1000)?),
            judge_max_poll_attempts: get_env_or("JUDGE_MAX_POLL_ATTEMPTS", 30)?,
            max_warnings: get_env_or("MAX_WARNINGS", 2)?,
            max_seconds_out_of_view: get_env_or("MAX_SECONDS_OUT_OF_VIEW", 30)?,
            signal_coalesce_window: Duration::from_millis(get_env_or("SIGNAL_COALESCE_MS", 0)?),
            recording_webhook_url: env::var("RECORDING_WEBHOOK_URL").ok().filter(|u| !u.is_empty()),
        })
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.max_seconds_out_of_view)
    }

    pub fn monitor_policy(&self) -> MonitorPolicy {
        MonitorPolicy {
            max_warnings: self.max_warnings,
            grace_period: self.grace_period(),
            coalesce_window: self.signal_coalesce_window,
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: self.judge_poll_interval,
            max_attempts: self.judge_max_poll_attempts,
        }
    }
}

fn get_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("Missing environment variable: {}", name)))
}

fn get_env_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("Invalid value for {}: {}", name, e))),
        Err(_) => Ok(default),
    }
}

pub fn init_config() -> Result<()> {
    let config = Config::from_env()?;
    CONFIG
        .set(config)
        .map_err(|_| Error::Config("Configuration has already been initialized".to_string()))?;
    Ok(())
}

pub fn get_config() -> Result<&'static Config> {
    CONFIG
        .get()
        .ok_or_else(|| Error::Config("Configuration has not been initialized".to_string()))
}
