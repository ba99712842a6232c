//! Cloudflare API client
//!
//! Base path: `/client/v4/`. Auth: bearer API token.
//! Every request carries the configured timeout; expiry surfaces as a
//! retriable `Error::Timeout`.

use super::{ClassCredentialConfig, ProviderFactory, TokenVerifier, Tunnel, TunnelProvider};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Tunnels configured from a local config file (ours), not the dashboard
const CONFIG_SOURCE_LOCAL: &str = "local";

/// Response envelope shared by every v4 endpoint
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
struct CreateTunnelRequest<'a> {
    name: &'a str,
    tunnel_secret: &'a str,
    config_src: &'a str,
}

fn transport_error(operation: &'static str, timeout: Duration, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout { operation, timeout }
    } else {
        Error::Transport(err)
    }
}

fn first_error_message(errors: &[ApiMessage]) -> Option<String> {
    errors
        .first()
        .map(|e| format!("{} (code {})", e.message, e.code))
}

/// Shared HTTP client for all provider calls
#[derive(Clone)]
pub struct CloudflareProviders {
    http: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl CloudflareProviders {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Self::with_client(http, base_url, timeout)
    }

    /// Wrap an existing `reqwest::Client`
    pub fn with_client(http: reqwest::Client, base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http,
            base_url,
            timeout,
        })
    }

    /// Client for one account's tunnels
    pub fn tunnels(&self, api_token: &str, account_id: &str) -> CloudflareTunnels {
        CloudflareTunnels {
            inner: self.clone(),
            api_token: api_token.to_string(),
            account_id: account_id.to_string(),
        }
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }
}

impl ProviderFactory for CloudflareProviders {
    fn token_verifier(&self) -> Arc<dyn TokenVerifier> {
        Arc::new(self.clone())
    }

    fn tunnel_provider(&self, config: &ClassCredentialConfig) -> Result<Arc<dyn TunnelProvider>> {
        if config.api_token.is_empty() {
            return Err(Error::MissingField(ClassCredentialConfig::API_TOKEN_KEY));
        }
        if config.account_id.is_empty() {
            return Err(Error::MissingField(ClassCredentialConfig::ACCOUNT_ID_KEY));
        }
        Ok(Arc::new(self.tunnels(&config.api_token, &config.account_id)))
    }
}

#[async_trait]
impl TokenVerifier for CloudflareProviders {
    async fn verify_token(&self, token: &str) -> Result<()> {
        let url = self.url("user/tokens/verify")?;
        debug!("GET {url}");

        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| transport_error("token verification", self.timeout, e))?;

        let status = resp.status();
        // The API has no dedicated "invalid token" response; 400 is what a bad token gets
        if status == StatusCode::BAD_REQUEST {
            return Err(Error::InvalidToken);
        }
        if status != StatusCode::OK {
            let message = match resp.json::<Envelope<serde_json::Value>>().await {
                Ok(envelope) => first_error_message(&envelope.errors)
                    .unwrap_or_else(|| "no error message in response".to_string()),
                Err(_) => "could not parse response".to_string(),
            };
            // Outage or throttling says nothing about the token itself
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return Err(Error::Provider {
                    status: status.as_u16(),
                    message,
                });
            }
            return Err(Error::ValidationFailed {
                status: status.as_u16(),
                message,
            });
        }

        Ok(())
    }
}

/// Tunnel operations scoped to one account
pub struct CloudflareTunnels {
    inner: CloudflareProviders,
    api_token: String,
    account_id: String,
}

impl CloudflareTunnels {
    fn tunnels_path(&self) -> String {
        format!("accounts/{}/cfd_tunnel", self.account_id)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let resp = request
            .bearer_auth(&self.api_token)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| transport_error(operation, self.inner.timeout, e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| transport_error(operation, self.inner.timeout, e))?;

        let envelope: Option<Envelope<T>> = serde_json::from_str(&body).ok();
        match envelope {
            Some(Envelope {
                success: true,
                result: Some(result),
                ..
            }) if status.is_success() => Ok(result),
            Some(envelope) => Err(Error::Provider {
                status: status.as_u16(),
                message: first_error_message(&envelope.errors)
                    .unwrap_or_else(|| format!("{operation} failed")),
            }),
            None => Err(Error::Provider {
                status: status.as_u16(),
                message: format!("{operation}: unparseable response body"),
            }),
        }
    }

    /// DELETE where "already gone" counts as done
    async fn delete(&self, operation: &'static str, path: &str) -> Result<()> {
        let url = self.inner.url(path)?;
        debug!("DELETE {url}");

        let request = self.inner.http.delete(url);
        match self.send::<serde_json::Value>(operation, request).await {
            Ok(_) => Ok(()),
            Err(Error::Provider { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl TunnelProvider for CloudflareTunnels {
    async fn list_tunnels(&self, name: &str) -> Result<Vec<Tunnel>> {
        let url = self.inner.url(&self.tunnels_path())?;
        debug!("GET {url} name={name}");

        let request = self
            .inner
            .http
            .get(url)
            .query(&[("name", name), ("is_deleted", "false")]);
        let tunnels: Vec<Tunnel> = self.send("list tunnels", request).await?;

        // The name filter is applied server side; re-check it so a looser
        // server match can't hand us someone else's tunnel
        Ok(tunnels
            .into_iter()
            .filter(|t| t.name == name && t.deleted_at.is_none())
            .collect())
    }

    async fn create_tunnel(&self, name: &str, secret: &str) -> Result<Tunnel> {
        let url = self.inner.url(&self.tunnels_path())?;
        debug!("POST {url} name={name}");

        let request = self.inner.http.post(url).json(&CreateTunnelRequest {
            name,
            tunnel_secret: secret,
            config_src: CONFIG_SOURCE_LOCAL,
        });
        self.send("create tunnel", request).await
    }

    async fn delete_tunnel(&self, tunnel_id: &str) -> Result<()> {
        let tunnel_path = format!("{}/{}", self.tunnels_path(), tunnel_id);

        // Stale connections block deletion
        self.delete(
            "cleanup tunnel connections",
            &format!("{tunnel_path}/connections"),
        )
        .await?;
        self.delete("delete tunnel", &tunnel_path).await
    }
}
