//! Tunnel config artifact
//!
//! The config file the connector runs with. Every constructor validates, so a
//! `TunnelConfig` value always satisfies:
//! - tunnel id is non-empty
//! - ingress is non-empty
//! - the last rule is the catch-all, and it is the only catch-all

use crate::ingress::IngressRule;
use crate::{CREDENTIALS_FILE_PATH, DEFAULT_CATCH_ALL_SERVICE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Config artifact validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("tunnel id is empty")]
    EmptyTunnelId,

    #[error("ingress rule set is empty")]
    EmptyRuleSet,

    #[error("last ingress rule must be a catch-all with no hostname, e.g. `service: http_status:404`")]
    MissingCatchAll,

    #[error("catch-all rule found at position {0}, only the last rule may omit its hostname")]
    DuplicateCatchAll(usize),

    #[error("failed to parse tunnel config: {0}")]
    Parse(String),
}

/// Tunnel config artifact (serialized as the connector's `config.yaml`)
///
/// Field order is the serialization order; keep it stable so equal configs
/// encode to identical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(rename = "tunnel")]
    tunnel_id: String,

    #[serde(rename = "credentials-file")]
    credentials_file: String,

    ingress: Vec<IngressRule>,
}

impl TunnelConfig {
    /// Build a config, appending the default catch-all when the supplied
    /// rules don't already end in one.
    ///
    /// An empty rule list is rejected rather than padded: callers that want
    /// the bare catch-all use [`TunnelConfig::default_for`].
    pub fn new(tunnel_id: impl Into<String>, mut rules: Vec<IngressRule>) -> Result<Self, ConfigError> {
        match rules.last() {
            None => return Err(ConfigError::EmptyRuleSet),
            Some(last) if !last.is_catch_all() => {
                rules.push(IngressRule::catch_all(DEFAULT_CATCH_ALL_SERVICE));
            }
            Some(_) => {}
        }

        let config = Self {
            tunnel_id: tunnel_id.into(),
            credentials_file: CREDENTIALS_FILE_PATH.to_string(),
            ingress: rules,
        };
        config.validate()?;
        Ok(config)
    }

    /// The config a freshly provisioned tunnel starts with
    pub fn default_for(tunnel_id: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(
            tunnel_id,
            vec![IngressRule::catch_all(DEFAULT_CATCH_ALL_SERVICE)],
        )
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tunnel_id.is_empty() {
            return Err(ConfigError::EmptyTunnelId);
        }

        let Some(last) = self.ingress.last() else {
            return Err(ConfigError::EmptyRuleSet);
        };
        if !last.is_catch_all() {
            return Err(ConfigError::MissingCatchAll);
        }

        let last_idx = self.ingress.len() - 1;
        if let Some(pos) = self.ingress[..last_idx].iter().position(IngressRule::is_catch_all) {
            return Err(ConfigError::DuplicateCatchAll(pos));
        }

        Ok(())
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn rules(&self) -> &[IngressRule] {
        &self.ingress
    }

    /// Consume the config, returning its rules
    pub fn into_rules(self) -> Vec<IngressRule> {
        self.ingress
    }

    /// Same rules, pointed at another tunnel
    pub fn with_tunnel_id(self, tunnel_id: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(tunnel_id, self.ingress)
    }

    /// Deterministic JSON encoding (valid YAML, which the connector reads)
    pub fn to_json(&self) -> String {
        // Only strings and a Vec of plain structs: serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse a persisted config and re-check its invariants
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        for rule in &mut config.ingress {
            if rule.hostname.as_deref() == Some("") {
                rule.hostname = None;
            }
        }
        config.validate()?;
        Ok(config)
    }
}
