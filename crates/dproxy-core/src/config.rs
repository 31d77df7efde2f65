//! Startup configuration. An optional `config.json` in the working directory
//! overrides the built-in minimal policy; once loaded it is never mutated.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::auth::AuthScheme;
use crate::probe::{LogFilterConfig, ProbeRules};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub allowed_domains: BTreeMap<String, DomainConfig>,
    #[serde(default)]
    pub probe_request: ProbeRules,
    #[serde(default)]
    pub probe_filter: LogFilterConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainConfig {
    #[serde(default)]
    pub auth_type: Option<AuthScheme>,
    #[serde(default = "default_https")]
    pub https: bool,
    /// Marks the upstream the OpenAI-compatibility facade falls back to for
    /// non-Gemini models. At most one entry should set this.
    #[serde(default)]
    pub default: bool,
}

fn default_https() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

pub fn load(path: &Path) -> Result<GatewayConfig, ConfigError> {
    if !path.exists() {
        return Ok(GatewayConfig::default());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
