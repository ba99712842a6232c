//! tunnelgate Common Types
//!
//! Pure data structures shared by the control plane: ingress rules and their
//! canonical ordering, the tunnel config artifact, and tunnel credentials.
//! Nothing in this crate talks to Kubernetes or the network.

pub mod credentials;
pub mod ingress;
pub mod tunnel_config;

pub use credentials::{generate_secret, CredentialError, TunnelCredentials};
pub use ingress::{sort_rules, IngressRule};
pub use tunnel_config::{ConfigError, TunnelConfig};

/// Service target of the default catch-all rule
pub const DEFAULT_CATCH_ALL_SERVICE: &str = "http_status:404";

/// Path the connector reads its credentials from (inside the workload)
pub const CREDENTIALS_FILE_PATH: &str = "/etc/cloudflared/creds/creds.json";

/// Path the connector reads its config from (inside the workload)
pub const CONFIG_FILE_PATH: &str = "/etc/cloudflared/config/config.yaml";

/// Length of generated tunnel secrets
pub const TUNNEL_SECRET_LEN: usize = 32;
