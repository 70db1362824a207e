// src/config.rs
//! Client configuration.
//!
//! Values are layered, later sources winning:
//! 1. Built-in defaults
//! 2. `civic_client.toml` in the working directory (optional)
//! 3. `CIVIC_*` environment variables, e.g. `CIVIC_ISSUER_URL` or
//!    `CIVIC_MAX_ATTEMPTS` (a `.env` file is loaded first by the binary)

use crate::services::proof_exchange::{ExchangeSettings, DEFAULT_CALL_TIMEOUT, DEFAULT_CHAIN, DEFAULT_NETWORK};
use crate::utils::retries::{PollConfig, DEFAULT_MAX_ATTEMPTS, DEFAULT_POLL_INTERVAL};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default configuration file name, without extension.
pub const CONFIG_FILE: &str = "civic_client";

const ENV_PREFIX: &str = "CIVIC";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Everything the client needs to reach its backends.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    pub identity_provider_url: String,
    pub issuer_url: String,
    pub verification_url: String,
    pub signer_url: String,
    pub chain: String,
    pub network: String,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub request_timeout_secs: u64,
    pub login_timeout_secs: u64,
    /// 0 lets the OS pick a free port
    pub callback_port: u16,
}

impl ClientConfig {
    /// Loads the configuration from `civic_client.toml` and the process
    /// environment.
    ///
    /// # Errors
    /// [`ConfigError::Load`] for unreadable sources or mistyped values,
    /// [`ConfigError::Invalid`] when [`Self::validate`] fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Some(CONFIG_FILE), Environment::with_prefix(ENV_PREFIX))
    }

    /// Loads the configuration from an optional file and an environment source.
    ///
    /// # Arguments
    /// * `file` - Config file name without extension; missing files are skipped
    /// * `environment` - Source of `CIVIC_*` overrides
    pub fn load_from(file: Option<&str>, environment: Environment) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("identity_provider_url", "https://identity.ic0.app/")?
            .set_default("issuer_url", "http://127.0.0.1:4943/issuer")?
            .set_default("verification_url", "https://dev.api.civic.com/sign-dev")?
            .set_default("signer_url", "http://aovwi-4maaa-aaaaa-qaagq-cai.localhost:4943/")?
            .set_default("chain", DEFAULT_CHAIN)?
            .set_default("network", DEFAULT_NETWORK)?
            .set_default("poll_interval_ms", DEFAULT_POLL_INTERVAL.as_millis() as i64)?
            .set_default("max_attempts", DEFAULT_MAX_ATTEMPTS as i64)?
            .set_default("request_timeout_secs", DEFAULT_CALL_TIMEOUT.as_secs() as i64)?
            .set_default("login_timeout_secs", 300i64)?
            .set_default("callback_port", 0i64)?;

        if let Some(file) = file {
            builder = builder.add_source(File::with_name(file).required(false));
        }

        let config: ClientConfig = builder
            .add_source(environment.try_parsing(true))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every backend URL parses and the timeouts are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("identity_provider_url", &self.identity_provider_url),
            ("issuer_url", &self.issuer_url),
            ("verification_url", &self.verification_url),
            ("signer_url", &self.signer_url),
        ] {
            Url::parse(value).map_err(|e| ConfigError::Invalid {
                key,
                reason: e.to_string(),
            })?;
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "request_timeout_secs",
                reason: "must be at least one second".into(),
            });
        }
        Ok(())
    }

    /// Retry policy of the token request.
    pub fn poll(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_attempts: self.max_attempts,
        }
    }

    /// Deadline of each remote call.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    /// Settings for a [`crate::ProofExchange`].
    pub fn exchange_settings(&self) -> ExchangeSettings {
        ExchangeSettings {
            chain: self.chain.clone(),
            network: self.network.clone(),
            poll: self.poll(),
            call_timeout: self.request_timeout(),
        }
    }
}
