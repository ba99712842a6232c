//! Tunnel provider API
//!
//! Traits the reconcilers talk to, so tests can swap in mocks, plus the
//! credential config a GatewayClass points at.

pub mod cloudflare;

use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

pub use cloudflare::CloudflareProviders;

/// Remote tunnel record
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Tunnel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

/// Provider credentials, read from the Secret a GatewayClass references
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ClassCredentialConfig {
    pub api_token: String,
    pub domain: String,
    pub email: String,
    pub account_id: String,
}

impl fmt::Debug for ClassCredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassCredentialConfig")
            .field("api_token", &"<redacted>")
            .field("domain", &self.domain)
            .field("email", &self.email)
            .field("account_id", &self.account_id)
            .finish()
    }
}

impl ClassCredentialConfig {
    pub const API_TOKEN_KEY: &'static str = "api_token";
    pub const DOMAIN_KEY: &'static str = "domain";
    pub const EMAIL_KEY: &'static str = "email";
    pub const ACCOUNT_ID_KEY: &'static str = "account_id";

    /// Read the four keys from a Secret; missing keys come back empty
    pub fn from_secret(secret: &Secret) -> Self {
        let read = |key: &str| -> String {
            if let Some(value) = secret.data.as_ref().and_then(|data| data.get(key)) {
                return String::from_utf8_lossy(&value.0).trim().to_string();
            }
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|value| value.trim().to_string())
                .unwrap_or_default()
        };

        Self {
            api_token: read(Self::API_TOKEN_KEY),
            domain: read(Self::DOMAIN_KEY),
            email: read(Self::EMAIL_KEY),
            account_id: read(Self::ACCOUNT_ID_KEY),
        }
    }
}

/// Tunnel CRUD for one provider account
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Non-deleted tunnels whose name is exactly `name`
    async fn list_tunnels(&self, name: &str) -> Result<Vec<Tunnel>>;

    /// Create a locally-configured tunnel authenticated by `secret`
    async fn create_tunnel(&self, name: &str, secret: &str) -> Result<Tunnel>;

    /// Purge the tunnel's connections, then delete it
    async fn delete_tunnel(&self, tunnel_id: &str) -> Result<()>;
}

/// API token introspection
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify_token(&self, token: &str) -> Result<()>;
}

/// Builds provider clients from per-class credentials
pub trait ProviderFactory: Send + Sync {
    fn token_verifier(&self) -> Arc<dyn TokenVerifier>;

    fn tunnel_provider(&self, config: &ClassCredentialConfig) -> Result<Arc<dyn TunnelProvider>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    #[test]
    fn test_config_from_secret_data() {
        let data = BTreeMap::from([
            ("api_token".to_string(), ByteString(b"tok\n".to_vec())),
            ("domain".to_string(), ByteString(b"example.com".to_vec())),
            ("email".to_string(), ByteString(b"ops@example.com".to_vec())),
            ("account_id".to_string(), ByteString(b"acct".to_vec())),
        ]);
        let secret = Secret {
            data: Some(data),
            ..Default::default()
        };

        let config = ClassCredentialConfig::from_secret(&secret);
        assert_eq!(config.api_token, "tok", "trailing newline from `echo` is trimmed");
        assert_eq!(config.domain, "example.com");
        assert_eq!(config.account_id, "acct");
    }

    #[test]
    fn test_config_missing_keys_are_empty() {
        let config = ClassCredentialConfig::from_secret(&Secret::default());
        assert_eq!(config, ClassCredentialConfig::default());
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = ClassCredentialConfig {
            api_token: "super-secret".to_string(),
            ..Default::default()
        };
        assert!(!format!("{:?}", config).contains("super-secret"));
    }
}
