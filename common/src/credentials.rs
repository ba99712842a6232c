//! Tunnel credentials and secret generation
//!
//! The connector authenticates with the secret the tunnel was created with.
//! Secrets are generated once, persisted once, and never regenerated while the
//! tunnel exists.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 63 symbols: digits, upper, lower, hyphen
const SECRET_ALPHABET: &[u8; 63] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz-";

/// Largest multiple of the alphabet size that fits in a byte (4 * 63).
/// Bytes at or above it are rejected to keep the draw uniform.
const REJECTION_BOUND: u8 = 252;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("secure random generator failed: {0}")]
    Rng(#[from] rand::Error),

    #[error("credential field {0} is empty")]
    EmptyField(&'static str),

    #[error("failed to parse tunnel credentials: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Generate a tunnel secret of `len` symbols from the OS CSPRNG
///
/// Fails only if the OS generator fails; there is no weaker fallback.
pub fn generate_secret(len: usize) -> Result<String, CredentialError> {
    let mut secret = String::with_capacity(len);
    let mut buf = [0u8; 64];

    while secret.len() < len {
        OsRng.try_fill_bytes(&mut buf)?;
        for &byte in buf.iter().filter(|&&b| b < REJECTION_BOUND) {
            if secret.len() == len {
                break;
            }
            secret.push(SECRET_ALPHABET[(byte % 63) as usize] as char);
        }
    }

    Ok(secret)
}

/// Credentials file the connector reads (`creds.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelCredentials {
    #[serde(rename = "AccountTag")]
    pub account_id: String,

    #[serde(rename = "TunnelSecret")]
    pub tunnel_secret: String,

    #[serde(rename = "TunnelID")]
    pub tunnel_id: String,
}

impl TunnelCredentials {
    pub fn new(
        account_id: impl Into<String>,
        tunnel_id: impl Into<String>,
        tunnel_secret: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let credentials = Self {
            account_id: account_id.into(),
            tunnel_secret: tunnel_secret.into(),
            tunnel_id: tunnel_id.into(),
        };

        if credentials.account_id.is_empty() {
            return Err(CredentialError::EmptyField("AccountTag"));
        }
        if credentials.tunnel_id.is_empty() {
            return Err(CredentialError::EmptyField("TunnelID"));
        }
        if credentials.tunnel_secret.is_empty() {
            return Err(CredentialError::EmptyField("TunnelSecret"));
        }

        Ok(credentials)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(raw: &str) -> Result<Self, CredentialError> {
        Ok(serde_json::from_str(raw)?)
    }
}
