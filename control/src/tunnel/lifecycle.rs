//! Tunnel lifecycle
//!
//! Brings one Gateway from "no tunnel" to "connector running" in four
//! steps, each safe to repeat and to resume after a failure:
//!
//! 1. remote tunnel (look up by name before creating)
//! 2. credential Secret (written once, while the tunnel secret is in hand)
//! 3. config ConfigMap (created once, then owned by the route merges)
//! 4. connector Deployment (applied every pass)

use crate::apis::metrics::record_tunnel_created;
use crate::error::{Error, Result};
use crate::provider::{Tunnel, TunnelProvider};
use crate::store::ClusterStore;
use crate::tunnel::resources::{
    self, build_config_map, build_credential_secret, build_deployment, config_checksum,
    read_config, read_credentials, TUNNEL_ID_ANNOTATION,
};
use common::{generate_secret, TunnelConfig, TunnelCredentials, TUNNEL_SECRET_LEN};
use gateway_api::apis::standard::gateways::Gateway;
use kube::ResourceExt;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tunnel found or created by `ensure_tunnel`
#[derive(Debug, Clone)]
pub struct EnsuredTunnel {
    pub tunnel: Tunnel,
    /// Set only when this call created the tunnel; the provider never returns it again
    pub fresh_secret: Option<String>,
}

/// Drives the provisioning steps for Gateways of one class
pub struct TunnelManager {
    store: Arc<dyn ClusterStore>,
    provider: Arc<dyn TunnelProvider>,
    account_id: String,
    connector_image: String,
}

impl TunnelManager {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        provider: Arc<dyn TunnelProvider>,
        account_id: impl Into<String>,
        connector_image: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provider,
            account_id: account_id.into(),
            connector_image: connector_image.into(),
        }
    }

    /// Reuse the tunnel named `name`, or create it
    ///
    /// More than one live tunnel with the name is never resolved
    /// automatically. Two racing creators can both miss on the lookup, so
    /// the list is repeated after a create to catch the duplicate.
    pub async fn ensure_tunnel(&self, name: &str) -> Result<EnsuredTunnel> {
        let mut existing = self.provider.list_tunnels(name).await?;

        match existing.len() {
            0 => {}
            1 => {
                let tunnel = existing.remove(0);
                debug!("Reusing tunnel {} ({})", name, tunnel.id);
                return Ok(EnsuredTunnel {
                    tunnel,
                    fresh_secret: None,
                });
            }
            count => {
                return Err(Error::AmbiguousExternalState {
                    name: name.to_string(),
                    count,
                })
            }
        }

        let secret = generate_secret(TUNNEL_SECRET_LEN)?;
        let tunnel = self.provider.create_tunnel(name, &secret).await?;
        record_tunnel_created();
        info!("Created tunnel {} ({})", name, tunnel.id);

        let count = self.provider.list_tunnels(name).await?.len();
        if count > 1 {
            return Err(Error::AmbiguousExternalState {
                name: name.to_string(),
                count,
            });
        }

        Ok(EnsuredTunnel {
            tunnel,
            fresh_secret: Some(secret),
        })
    }

    /// Persist the tunnel credentials once
    ///
    /// An existing Secret for the same tunnel is left alone. The tunnel is
    /// deleted (and recreated on the next pass) only when the Secret was
    /// read successfully and is absent or bound to another tunnel, and the
    /// secret from a fresh create is not in hand. A Secret that exists but
    /// cannot be read as credentials is reported and never costs the tunnel.
    pub async fn ensure_credential(&self, gateway: &Gateway, ensured: &EnsuredTunnel) -> Result<()> {
        let namespace = gateway_namespace(gateway);
        let name = resources::secret_name(&gateway.name_any());
        let tunnel_id = &ensured.tunnel.id;

        let existing = self.store.get_secret(&namespace, &name).await?;

        if let Some(secret) = &existing {
            match read_credentials(secret) {
                Some(Ok(creds)) if &creds.tunnel_id == tunnel_id => {
                    debug!("Credentials {}/{} already present", namespace, name);
                    return Ok(());
                }
                Some(Ok(creds)) => {
                    info!(
                        "Credentials {}/{} belong to tunnel {}, current tunnel is {}",
                        namespace, name, creds.tunnel_id, tunnel_id
                    );
                }
                Some(Err(e)) if ensured.fresh_secret.is_none() => {
                    warn!(
                        "Credentials {}/{} unreadable, leaving tunnel {} in place: {}",
                        namespace, name, tunnel_id, e
                    );
                    return Err(e);
                }
                None if ensured.fresh_secret.is_none() => {
                    warn!(
                        "Secret {}/{} has no credentials, leaving tunnel {} in place",
                        namespace, name, tunnel_id
                    );
                    return Err(Error::MissingObject {
                        kind: "tunnel credentials",
                        name: format!("{}/{}", namespace, name),
                    });
                }
                Some(Err(e)) => warn!("Credentials {}/{} unreadable: {}", namespace, name, e),
                None => warn!("Secret {}/{} has no credentials", namespace, name),
            }
        }

        let Some(fresh_secret) = &ensured.fresh_secret else {
            warn!(
                "Tunnel {} has no usable credentials and its secret is unrecoverable, deleting it",
                tunnel_id
            );
            self.provider.delete_tunnel(tunnel_id).await?;
            return Err(Error::OrphanedTunnel {
                tunnel_id: tunnel_id.clone(),
            });
        };

        let credentials = TunnelCredentials::new(&self.account_id, tunnel_id, fresh_secret)?;
        let mut secret = build_credential_secret(gateway, &credentials);

        match existing {
            Some(current) => {
                secret.metadata.resource_version = current.metadata.resource_version;
                self.store.replace_secret(&namespace, &secret).await?;
                info!("Rebound credentials {}/{} to tunnel {}", namespace, name, tunnel_id);
            }
            None => {
                self.store.create_secret(&namespace, &secret).await?;
                info!("Stored credentials {}/{} for tunnel {}", namespace, name, tunnel_id);
            }
        }

        Ok(())
    }

    /// Create the default config if there is none; returns the persisted bytes
    ///
    /// Existing rules are never touched. A config naming another tunnel (the
    /// tunnel was recreated) is re-pointed at the current one.
    pub async fn ensure_config(&self, gateway: &Gateway, tunnel_id: &str) -> Result<String> {
        let namespace = gateway_namespace(gateway);
        let name = resources::config_map_name(&gateway.name_any());

        let Some(mut config_map) = self.store.get_config_map(&namespace, &name).await? else {
            let config = TunnelConfig::default_for(tunnel_id)?;
            self.store
                .create_config_map(&namespace, &build_config_map(gateway, &config))
                .await?;
            info!("Created default tunnel config {}/{}", namespace, name);
            return Ok(config.to_json());
        };

        let persisted = read_config(&config_map).map(TunnelConfig::from_json);
        let config = match persisted {
            Some(Ok(config)) if config.tunnel_id() == tunnel_id => {
                return Ok(config_map_raw(&config_map));
            }
            Some(Ok(config)) => {
                info!(
                    "Re-pointing tunnel config {}/{} from {} to {}",
                    namespace,
                    name,
                    config.tunnel_id(),
                    tunnel_id
                );
                config.with_tunnel_id(tunnel_id)?
            }
            Some(Err(e)) => {
                warn!("Tunnel config {}/{} is invalid ({}), resetting", namespace, name, e);
                TunnelConfig::default_for(tunnel_id)?
            }
            None => {
                warn!("Tunnel config {}/{} is empty, resetting", namespace, name);
                TunnelConfig::default_for(tunnel_id)?
            }
        };

        let owners = resources::read_owners(&config_map);
        resources::write_config(&mut config_map, &config, &owners);
        self.store.replace_config_map(&namespace, &config_map).await?;

        Ok(config.to_json())
    }

    /// Apply the connector Deployment for the current tunnel and config
    pub async fn ensure_workload(
        &self,
        gateway: &Gateway,
        tunnel_id: &str,
        config_checksum: &str,
    ) -> Result<()> {
        let namespace = gateway_namespace(gateway);
        let deployment =
            build_deployment(gateway, &self.connector_image, tunnel_id, config_checksum);
        self.store.apply_deployment(&namespace, &deployment).await
    }

    /// Run all four steps and record the tunnel id on the Gateway
    pub async fn provision(&self, gateway: &Gateway) -> Result<String> {
        let name = gateway.name_any();

        let ensured = self.ensure_tunnel(&name).await?;
        self.ensure_credential(gateway, &ensured).await?;

        let tunnel_id = ensured.tunnel.id;
        let raw_config = self.ensure_config(gateway, &tunnel_id).await?;
        self.ensure_workload(gateway, &tunnel_id, &config_checksum(&raw_config))
            .await?;

        if gateway.annotations().get(TUNNEL_ID_ANNOTATION) != Some(&tunnel_id) {
            let patch = json!({
                "metadata": {
                    "annotations": { TUNNEL_ID_ANNOTATION: &tunnel_id }
                }
            });
            self.store
                .patch_gateway_metadata(&gateway_namespace(gateway), &name, &patch)
                .await?;
        }

        Ok(tunnel_id)
    }
}

fn gateway_namespace(gateway: &Gateway) -> String {
    gateway.namespace().unwrap_or_else(|| "default".to_string())
}

fn config_map_raw(config_map: &k8s_openapi::api::core::v1::ConfigMap) -> String {
    read_config(config_map).unwrap_or_default().to_string()
}
