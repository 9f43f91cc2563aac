use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use testport_core::protocol::{
    PROP_AUTH_TOKEN, PROP_EXPECTED_SHA256, PROP_PROTOCOL_VERSION, PROP_SOCKET_PATH,
    PROP_SYNC_TIMEOUT_MS,
};
use thiserror::Error;

pub type Properties = BTreeMap<String, String>;

pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

const ENV_FALLBACKS: [(&str, &str); 5] = [
    (PROP_SOCKET_PATH, "TESTPORT_AGENT_SOCKET_PATH"),
    (PROP_AUTH_TOKEN, "TESTPORT_AGENT_AUTH_TOKEN"),
    (PROP_PROTOCOL_VERSION, "TESTPORT_AGENT_PROTOCOL_VERSION"),
    (PROP_EXPECTED_SHA256, "TESTPORT_AGENT_EXPECTED_SHA256"),
    (PROP_SYNC_TIMEOUT_MS, "TESTPORT_AGENT_SYNC_TIMEOUT_MS"),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgentConfigError {
    #[error("missing required property {key}")]
    MissingProperty { key: &'static str },
    #[error("invalid value {value:?} for property {key}: {reason}")]
    InvalidProperty {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Control-channel settings injected into the server process at launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub socket_path: PathBuf,
    pub auth_token: String,
    pub protocol_version: String,
    pub expected_agent_sha256: Option<String>,
    pub sync_timeout: Duration,
}

impl AgentConfig {
    pub fn from_properties(properties: &Properties) -> Result<Self, AgentConfigError> {
        let socket_path = PathBuf::from(required(properties, PROP_SOCKET_PATH)?);
        let auth_token = required(properties, PROP_AUTH_TOKEN)?.to_string();
        let protocol_version = required(properties, PROP_PROTOCOL_VERSION)?.to_string();
        let expected_agent_sha256 = optional(properties, PROP_EXPECTED_SHA256).map(str::to_string);
        let sync_timeout = match optional(properties, PROP_SYNC_TIMEOUT_MS) {
            Some(raw) => parse_timeout_ms(PROP_SYNC_TIMEOUT_MS, raw)?,
            None => DEFAULT_SYNC_TIMEOUT,
        };
        Ok(Self {
            socket_path,
            auth_token,
            protocol_version,
            expected_agent_sha256,
            sync_timeout,
        })
    }

    pub fn from_env() -> Result<Self, AgentConfigError> {
        Self::from_properties(&properties_from_env())
    }
}

/// Collects the agent properties that are set through environment variables.
pub fn properties_from_env() -> Properties {
    let mut properties = Properties::new();
    for (key, env_var) in ENV_FALLBACKS {
        if let Ok(value) = std::env::var(env_var) {
            properties.insert(key.to_string(), value);
        }
    }
    properties
}

fn required<'a>(properties: &'a Properties, key: &'static str) -> Result<&'a str, AgentConfigError> {
    optional(properties, key).ok_or(AgentConfigError::MissingProperty { key })
}

fn optional<'a>(properties: &'a Properties, key: &str) -> Option<&'a str> {
    properties
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn parse_timeout_ms(key: &'static str, raw: &str) -> Result<Duration, AgentConfigError> {
    match raw.parse::<u64>() {
        Ok(0) => Err(AgentConfigError::InvalidProperty {
            key,
            value: raw.to_string(),
            reason: "must be positive",
        }),
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(_) => Err(AgentConfigError::InvalidProperty {
            key,
            value: raw.to_string(),
            reason: "expected milliseconds",
        }),
    }
}
