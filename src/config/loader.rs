use crate::config::ThrottleConfig;
use crate::error::{Error, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub throttle: ThrottleConfig,
    pub driver: DriverConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Parameters of the burst the binary pushes through the throttle.
#[derive(Debug, Deserialize)]
pub struct DriverConfig {
    pub interval_ms: u64,
    pub calls: usize,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name("config/default"))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(Environment::with_prefix("THROTTLER").separator("__"))
            .build()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        let app: AppConfig = config.try_deserialize()
            .map_err(|e| Error::ConfigError(e.to_string()))?;
        app.throttle.validate()?;
        Ok(app)
    }
}
