//! Optional JSON configuration file
//!
//! Every field is optional; whatever is absent keeps the engine default or
//! the command-line value.
//!
//! ```json
//! {
//!   "requestTimeoutSecs": 20,
//!   "subprotocols": ["ocpp1.6"],
//!   "basicAuth": { "username": "CP001", "password": "secret" },
//!   "routes": { "CP7": "NN1" }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use ocpp_core::{OcppConfig, ProtocolVersion};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown sub-protocol '{0}'")]
    UnknownSubprotocol(String),

    #[error("route '{0}' is not of the form DESTINATION=NEIGHBOR")]
    InvalidRoute(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeSettings {
    pub request_timeout_secs: Option<u64>,
    pub handler_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub strict_schema: Option<bool>,
    pub ping_interval_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub reconnect_delay_secs: Option<u64>,
    pub max_reconnect_delay_secs: Option<u64>,
    pub service_namespace: Option<String>,
    pub subprotocols: Option<Vec<String>>,
    pub basic_auth: Option<Credentials>,
    /// Destination node -> neighbor to reach it through
    pub routes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl NodeSettings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Overlay the file's values onto `config`
    pub fn apply(&self, mut config: OcppConfig) -> Result<OcppConfig, SettingsError> {
        if let Some(secs) = self.request_timeout_secs {
            config = config.with_request_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.handler_timeout_secs {
            config = config.with_handler_timeout(Duration::from_secs(secs));
        }
        if let Some(retries) = self.max_retries {
            config = config.with_max_retries(retries);
        }
        if let Some(strict) = self.strict_schema {
            config = config.with_strict_schema(strict);
        }
        if let Some(secs) = self.ping_interval_secs {
            config = config.with_ping_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = self.poll_interval_secs {
            config = config.with_poll_interval(Duration::from_secs(secs));
        }
        if self.reconnect_delay_secs.is_some() || self.max_reconnect_delay_secs.is_some() {
            let initial = self
                .reconnect_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(config.reconnect_delay);
            let max = self
                .max_reconnect_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(config.max_reconnect_delay);
            config = config.with_reconnect(initial, max);
        }
        if let Some(namespace) = &self.service_namespace {
            config = config.with_service_namespace(namespace.clone());
        }
        if let Some(tokens) = &self.subprotocols {
            config = config.with_subprotocols(parse_subprotocols(tokens)?);
        }
        if let Some(auth) = &self.basic_auth {
            config = config.with_basic_auth(auth.username.clone(), auth.password.clone());
        }
        Ok(config)
    }
}

pub fn parse_subprotocols(tokens: &[String]) -> Result<Vec<ProtocolVersion>, SettingsError> {
    tokens
        .iter()
        .map(|token| {
            ProtocolVersion::from_subprotocol(token)
                .ok_or_else(|| SettingsError::UnknownSubprotocol(token.clone()))
        })
        .collect()
}

/// Parse a `DESTINATION=NEIGHBOR` route argument
pub fn parse_route(arg: &str) -> Result<(String, String), SettingsError> {
    match arg.split_once('=') {
        Some((destination, via)) if !destination.trim().is_empty() && !via.trim().is_empty() => {
            Ok((destination.trim().to_string(), via.trim().to_string()))
        }
        _ => Err(SettingsError::InvalidRoute(arg.to_string())),
    }
}
