//! Gateway watcher
//!
//! Provisions a tunnel for every owned Gateway: remote tunnel, credential
//! Secret, config ConfigMap and connector Deployment. The ConfigMap is
//! owned by the Gateway, so route write-backs re-trigger this loop and the
//! connector rolls onto the new config checksum.

use crate::apis::gateway::ownership::{owning_class, OwnedObject};
use crate::apis::gateway::validator::load_class_config;
use crate::apis::gateway::{condition, conditions_current, log_failure, status_conditions};
use crate::apis::metrics::{record_reconciliation, ControlLoop};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::tunnel::lifecycle::TunnelManager;
use crate::tunnel::resources::GATEWAY_LABEL;
use futures::StreamExt;
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use gateway_api::apis::standard::gateways::Gateway;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Gateway reconciler
pub struct GatewayReconciler {
    client: Client,
    ctx: Arc<Context>,
}

impl GatewayReconciler {
    pub fn new(client: Client, ctx: Arc<Context>) -> Self {
        Self { client, ctx }
    }

    /// Reconcile a single Gateway
    pub async fn reconcile(gateway: Arc<Gateway>, ctx: Arc<Context>) -> Result<Action> {
        let start = Instant::now();
        let result = Self::sync(&gateway, &ctx).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.metric_label(),
        };
        record_reconciliation(ControlLoop::Gateway, start.elapsed().as_secs_f64(), outcome);
        result
    }

    async fn sync(gateway: &Gateway, ctx: &Context) -> Result<Action> {
        let namespace = gateway.namespace().unwrap_or_else(|| "default".to_string());
        let name = gateway.name_any();

        // Generated objects are garbage-collected through their owner references
        if gateway.metadata.deletion_timestamp.is_some() {
            debug!("Gateway {}/{} is being deleted", namespace, name);
            return Ok(Action::await_change());
        }

        let Some(class) = owning_class(
            ctx.store.as_ref(),
            &ctx.config.controller_name,
            &OwnedObject::Gateway(gateway),
        )
        .await?
        else {
            debug!(
                "Gateway {}/{} references GatewayClass '{}', ignoring",
                namespace, name, gateway.spec.gateway_class_name
            );
            return Ok(Action::await_change());
        };

        info!("Reconciling Gateway: {}/{}", namespace, name);

        match Self::provision(gateway, &class, ctx).await {
            Ok(tunnel_id) => {
                Self::set_gateway_status(
                    gateway,
                    ctx,
                    true,
                    &format!("Tunnel {} is programmed", tunnel_id),
                )
                .await?;
                Ok(Action::requeue(ctx.config.timeouts.resync_interval()))
            }
            Err(e) => {
                if let Err(status_err) =
                    Self::set_gateway_status(gateway, ctx, false, &e.to_string()).await
                {
                    warn!(
                        "Failed to report Gateway {}/{} as pending: {}",
                        namespace, name, status_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Resolve the class credentials and run the tunnel lifecycle
    async fn provision(gateway: &Gateway, class: &GatewayClass, ctx: &Context) -> Result<String> {
        let credentials =
            load_class_config(ctx.store.as_ref(), class, &ctx.config.parameters_namespace).await?;
        let provider = ctx.providers.tunnel_provider(&credentials)?;

        TunnelManager::new(
            ctx.store.clone(),
            provider,
            credentials.account_id,
            ctx.config.connector_image.clone(),
        )
        .provision(gateway)
        .await
    }

    /// Update Gateway status with Accepted and Programmed conditions
    async fn set_gateway_status(
        gateway: &Gateway,
        ctx: &Context,
        programmed: bool,
        message: &str,
    ) -> Result<()> {
        let namespace = gateway.namespace().unwrap_or_else(|| "default".to_string());
        let name = gateway.name_any();
        let generation = gateway.metadata.generation;

        let desired = [
            condition("Accepted", true, "Accepted", "Gateway is accepted", generation),
            if programmed {
                condition("Programmed", true, "Programmed", message, generation)
            } else {
                condition("Programmed", false, "Pending", message, generation)
            },
        ];

        if conditions_current(status_conditions(gateway.status.as_ref()).as_ref(), &desired) {
            return Ok(());
        }

        let status = json!({ "status": { "conditions": desired } });
        ctx.store
            .patch_gateway_status(&namespace, &name, &status)
            .await?;

        info!(
            "Updated Gateway {}/{} status: programmed={}",
            namespace, name, programmed
        );
        Ok(())
    }

    /// Error handler for controller
    fn error_policy(gateway: Arc<Gateway>, error: &Error, ctx: Arc<Context>) -> Action {
        let key = format!(
            "{}/{}",
            gateway.namespace().unwrap_or_default(),
            gateway.name_any()
        );
        log_failure("Gateway", &key, error);
        Action::requeue(ctx.config.timeouts.error_requeue())
    }

    /// Start the Gateway controller
    pub async fn run(self) -> Result<()> {
        let api: Api<Gateway> = Api::all(self.client.clone());
        let config_maps: Api<ConfigMap> = Api::all(self.client.clone());

        info!("Starting Gateway controller");

        Controller::new(api, WatcherConfig::default())
            .owns(config_maps, WatcherConfig::default().labels(GATEWAY_LABEL))
            .run(Self::reconcile, Self::error_policy, self.ctx)
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled Gateway: {:?}", o),
                    Err(e) => debug!("Gateway reconcile pass failed: {}", e),
                }
            })
            .await;

        error!("Gateway controller stream ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::testing::{
        credential_secret, gateway, gateway_class, InMemoryProvider, InMemoryProviders,
        InMemoryStore,
    };
    use crate::tunnel::resources::{CONFIG_CHECKSUM_ANNOTATION, TUNNEL_ID_ANNOTATION};

    const CONTROLLER: &str = "tunnelgate.io/gateway-controller";

    fn context(store: &Arc<InMemoryStore>, provider: &Arc<InMemoryProvider>) -> Arc<Context> {
        Arc::new(Context::new(
            store.clone(),
            Arc::new(InMemoryProviders::accepting(provider.clone())),
            ControllerConfig::default(),
        ))
    }

    fn owned_setup() -> (Arc<InMemoryStore>, Arc<InMemoryProvider>) {
        let store = Arc::new(InMemoryStore::default());
        store.put_gateway_class(gateway_class("tunnelgate", CONTROLLER, Some(("ops", "cf-creds"))));
        store.put_secret(credential_secret("ops", "cf-creds", "tok"));
        store.put_gateway(gateway("edge", "gw1", "tunnelgate"));
        (store, Arc::new(InMemoryProvider::default()))
    }

    fn condition_of(status: &serde_json::Value, type_: &str) -> serde_json::Value {
        status["conditions"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["type"] == type_)
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_owned_gateway_is_provisioned_and_programmed() {
        let (store, provider) = owned_setup();
        let ctx = context(&store, &provider);

        let gw = store.gateway("edge", "gw1").unwrap();
        let action = GatewayReconciler::reconcile(Arc::new(gw), ctx.clone())
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(ctx.config.timeouts.resync_interval()));

        assert_eq!(provider.tunnel_count("gw1"), 1);
        assert!(store.secret("edge", "gw1-secret").is_some());
        assert!(store.config("edge", "gw1").is_some());

        let deployment = store.deployment("edge", "gw1").unwrap();
        let annotations = deployment
            .spec
            .unwrap()
            .template
            .metadata
            .unwrap()
            .annotations
            .unwrap();
        assert!(annotations.contains_key(CONFIG_CHECKSUM_ANNOTATION));

        let tunnel_id = store
            .gateway("edge", "gw1")
            .unwrap()
            .annotations()
            .get(TUNNEL_ID_ANNOTATION)
            .cloned()
            .unwrap();
        let status = store.status("Gateway", "edge", "gw1").unwrap();
        let programmed = condition_of(&status, "Programmed");
        assert_eq!(programmed["status"], "True");
        assert!(programmed["message"].as_str().unwrap().contains(&tunnel_id));
    }

    #[tokio::test]
    async fn test_repeated_reconcile_creates_one_tunnel() {
        let (store, provider) = owned_setup();
        let ctx = context(&store, &provider);

        for _ in 0..3 {
            let gw = store.gateway("edge", "gw1").unwrap();
            GatewayReconciler::reconcile(Arc::new(gw), ctx.clone())
                .await
                .unwrap();
        }

        assert_eq!(provider.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_class_secret_leaves_gateway_pending() {
        let store = Arc::new(InMemoryStore::default());
        store.put_gateway_class(gateway_class("tunnelgate", CONTROLLER, Some(("ops", "cf-creds"))));
        store.put_gateway(gateway("edge", "gw1", "tunnelgate"));
        let provider = Arc::new(InMemoryProvider::default());
        let ctx = context(&store, &provider);

        let gw = store.gateway("edge", "gw1").unwrap();
        let err = GatewayReconciler::reconcile(Arc::new(gw), ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::MissingObject { kind: "Secret", .. }));
        assert_eq!(provider.create_calls(), 0);

        let status = store.status("Gateway", "edge", "gw1").unwrap();
        let programmed = condition_of(&status, "Programmed");
        assert_eq!(programmed["status"], "False");
        assert_eq!(programmed["reason"], "Pending");
    }

    #[tokio::test]
    async fn test_gateway_of_foreign_class_is_ignored() {
        let store = Arc::new(InMemoryStore::default());
        store.put_gateway_class(gateway_class("nginx", "nginx.org/controller", None));
        let provider = Arc::new(InMemoryProvider::default());
        let ctx = context(&store, &provider);

        let gw = gateway("edge", "gw1", "nginx");
        let action = GatewayReconciler::reconcile(Arc::new(gw), ctx)
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(provider.create_calls(), 0);
        assert_eq!(store.status_writes(), 0);
    }
}
