//! Connection configuration.
//!
//! Values can come from code, from any serde source, or from `PULP_*`
//! environment variables. Unset fields fall back to the defaults below.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ApiError;
use crate::transport::DEFAULT_MAX_RETRIES;

/// Settings needed to open a `Connection`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Base address of the server, e.g. `https://pulp.example.com`.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Certificate verification; off by default since test deployments
    /// typically run with self-signed certificates.
    pub verify_tls: bool,
    pub max_retries: u32,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: Option<u64>,
    /// Start with strict response validation switched on.
    pub strict: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "https://localhost".to_string(),
            username: None,
            password: None,
            verify_tls: false,
            max_retries: DEFAULT_MAX_RETRIES,
            request_timeout_secs: None,
            strict: false,
        }
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Read `PULP_URL`, `PULP_USERNAME`, `PULP_PASSWORD`, `PULP_VERIFY_TLS`,
    /// `PULP_MAX_RETRIES`, `PULP_TIMEOUT` and `PULP_STRICT`.
    pub fn from_env() -> Result<Self, ApiError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ApiError> {
        let mut config = Self::default();
        if let Some(url) = lookup("PULP_URL") {
            config.url = url;
        }
        config.username = lookup("PULP_USERNAME");
        config.password = lookup("PULP_PASSWORD");
        if let Some(value) = lookup("PULP_VERIFY_TLS") {
            config.verify_tls = parse_flag("PULP_VERIFY_TLS", &value)?;
        }
        if let Some(value) = lookup("PULP_MAX_RETRIES") {
            config.max_retries = parse_number("PULP_MAX_RETRIES", &value)?;
        }
        if let Some(value) = lookup("PULP_TIMEOUT") {
            config.request_timeout_secs = Some(parse_number("PULP_TIMEOUT", &value)?);
        }
        if let Some(value) = lookup("PULP_STRICT") {
            config.strict = parse_flag("PULP_STRICT", &value)?;
        }
        Ok(config)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ApiError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ApiError::Deserialization(format!("{key}: expected a boolean, got {other:?}"))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ApiError> {
    value
        .trim()
        .parse()
        .map_err(|_| ApiError::Deserialization(format!("{key}: expected a number, got {value:?}")))
}
