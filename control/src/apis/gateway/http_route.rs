//! HTTPRoute watcher
//!
//! Merges each owned route's hostnames into its parent Gateway's tunnel
//! config. A finalizer keeps deleted routes around until the rules they
//! own have been pruned.

use crate::apis::gateway::ownership::{is_owned, parent_gateway, OwnedObject};
use crate::apis::gateway::{condition, conditions_current, log_failure};
use crate::apis::metrics::{record_config_write, record_reconciliation, ControlLoop};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::tunnel::merge::{apply_route, build_fragment, remove_route, route_key, RouteWrite};
use crate::tunnel::resources::{config_map_name, read_config, read_owners, write_config};
use futures::StreamExt;
use gateway_api::apis::standard::gateways::Gateway;
use gateway_api::apis::standard::httproutes::HTTPRoute;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Held by every route whose rules may be in a tunnel config
pub const ROUTE_FINALIZER: &str = "tunnelgate.io/ingress-cleanup";

/// HTTPRoute reconciler
pub struct HTTPRouteReconciler {
    client: Client,
    ctx: Arc<Context>,
}

/// HTTPRoute status parameters
struct RouteStatus {
    resolved_refs: bool,
    resolved_refs_reason: &'static str,
    resolved_refs_message: String,
}

impl HTTPRouteReconciler {
    pub fn new(client: Client, ctx: Arc<Context>) -> Self {
        Self { client, ctx }
    }

    /// Reconcile a single HTTPRoute
    pub async fn reconcile(route: Arc<HTTPRoute>, ctx: Arc<Context>) -> Result<Action> {
        let start = Instant::now();
        let result = Self::sync(&route, &ctx).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.metric_label(),
        };
        record_reconciliation(ControlLoop::HttpRoute, start.elapsed().as_secs_f64(), outcome);
        result
    }

    async fn sync(route: &HTTPRoute, ctx: &Context) -> Result<Action> {
        let key = route_key(route);
        let store = ctx.store.as_ref();

        if route.metadata.deletion_timestamp.is_some() {
            if has_finalizer(route) {
                info!("HTTPRoute {} deleted, pruning its rules", key);
                Self::cleanup(route, ctx).await?;
                Self::set_finalizer(route, ctx, false).await?;
            }
            return Ok(Action::await_change());
        }

        if !is_owned(store, &ctx.config.controller_name, &OwnedObject::HttpRoute(route)).await? {
            debug!("HTTPRoute {} does not attach to one of our Gateways, ignoring", key);
            return Ok(Action::await_change());
        }

        // Gone between the ownership check and now
        let Some(gateway) = parent_gateway(store, route).await? else {
            return Ok(Action::await_change());
        };

        info!("Reconciling HTTPRoute: {}", key);

        if !has_finalizer(route) {
            Self::set_finalizer(route, ctx, true).await?;
        }

        let fragment = build_fragment(route);
        let status = if fragment.is_empty() {
            warn!("HTTPRoute {} has no backendRef, contributing no rules", key);
            RouteStatus {
                resolved_refs: false,
                resolved_refs_reason: "BackendNotFound",
                resolved_refs_message: "HTTPRoute has no backendRef".to_string(),
            }
        } else {
            RouteStatus {
                resolved_refs: true,
                resolved_refs_reason: "ResolvedRefs",
                resolved_refs_message: format!("{} ingress rule(s) programmed", fragment.len()),
            }
        };

        let (namespace, mut config_map) = Self::tunnel_config_map(&gateway, ctx).await?;
        let raw = read_config(&config_map).unwrap_or_default().to_string();
        let owners = read_owners(&config_map);

        match apply_route(&raw, &owners, &key, &fragment)? {
            Some(write) => {
                Self::write_back(&namespace, &gateway, &mut config_map, write, ctx).await?;
                info!("HTTPRoute {} merged into Gateway {}/{}", key, namespace, gateway.name_any());
            }
            None => debug!("HTTPRoute {} already merged", key),
        }

        Self::set_route_status(route, &gateway, ctx, status).await?;

        Ok(Action::requeue(ctx.config.timeouts.resync_interval()))
    }

    /// Prune every rule the route owns from its Gateway's config
    async fn cleanup(route: &HTTPRoute, ctx: &Context) -> Result<()> {
        let key = route_key(route);

        // Without a Gateway the ConfigMap is garbage-collected with it
        let Some(gateway) = parent_gateway(ctx.store.as_ref(), route).await? else {
            return Ok(());
        };
        let (namespace, mut config_map) = match Self::tunnel_config_map(&gateway, ctx).await {
            Ok(found) => found,
            Err(Error::MissingObject { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };

        let raw = read_config(&config_map).unwrap_or_default().to_string();
        let owners = read_owners(&config_map);

        if let Some(write) = remove_route(&raw, &owners, &key)? {
            Self::write_back(&namespace, &gateway, &mut config_map, write, ctx).await?;
            info!("Pruned rules of HTTPRoute {}", key);
        }
        Ok(())
    }

    /// The Gateway's tunnel ConfigMap; absent until the Gateway is provisioned
    async fn tunnel_config_map(gateway: &Gateway, ctx: &Context) -> Result<(String, ConfigMap)> {
        let namespace = gateway.namespace().unwrap_or_else(|| "default".to_string());
        let name = config_map_name(&gateway.name_any());

        match ctx.store.get_config_map(&namespace, &name).await? {
            Some(config_map) => Ok((namespace, config_map)),
            None => Err(Error::MissingObject {
                kind: "ConfigMap",
                name: format!("{}/{}", namespace, name),
            }),
        }
    }

    /// Persist a merge result; the replace carries the read resourceVersion
    async fn write_back(
        namespace: &str,
        gateway: &Gateway,
        config_map: &mut ConfigMap,
        write: RouteWrite,
        ctx: &Context,
    ) -> Result<()> {
        write_config(config_map, &write.config, &write.owners);
        ctx.store.replace_config_map(namespace, config_map).await?;
        record_config_write(namespace, &gateway.name_any(), write.config.rules().len());
        Ok(())
    }

    /// Add or remove the cleanup finalizer
    async fn set_finalizer(route: &HTTPRoute, ctx: &Context, present: bool) -> Result<()> {
        let mut finalizers: Vec<String> = route
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != ROUTE_FINALIZER)
            .cloned()
            .collect();
        if present {
            finalizers.push(ROUTE_FINALIZER.to_string());
        }

        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": route.resource_version(),
            }
        });
        ctx.store
            .patch_http_route_metadata(
                &route.namespace().unwrap_or_else(|| "default".to_string()),
                &route.name_any(),
                &patch,
            )
            .await
    }

    /// Update this controller's entry in the route's parent status
    async fn set_route_status(
        route: &HTTPRoute,
        gateway: &Gateway,
        ctx: &Context,
        status: RouteStatus,
    ) -> Result<()> {
        let namespace = route.namespace().unwrap_or_else(|| "default".to_string());
        let name = route.name_any();
        let generation = route.metadata.generation;
        let controller_name = &ctx.config.controller_name;

        let conditions = [
            condition(
                "Accepted",
                true,
                "Accepted",
                "HTTPRoute is accepted",
                generation,
            ),
            condition(
                "ResolvedRefs",
                status.resolved_refs,
                status.resolved_refs_reason,
                &status.resolved_refs_message,
                generation,
            ),
        ];

        // Parent entries written by other controllers are kept
        let mut parents: Vec<Value> = status_parents(route);
        let ours = parents
            .iter()
            .position(|p| p["controllerName"] == controller_name.as_str());
        if let Some(index) = ours {
            let current = parents.remove(index);
            if conditions_current(current.get("conditions"), &conditions) {
                return Ok(());
            }
        }

        parents.push(json!({
            "parentRef": {
                "group": "gateway.networking.k8s.io",
                "kind": "Gateway",
                "name": gateway.name_any(),
                "namespace": gateway.namespace(),
            },
            "controllerName": controller_name,
            "conditions": conditions,
        }));

        let status_json = json!({ "status": { "parents": parents } });
        ctx.store
            .patch_http_route_status(&namespace, &name, &status_json)
            .await?;

        info!(
            "Updated HTTPRoute {}/{} status: resolvedRefs={}",
            namespace, name, status.resolved_refs
        );
        Ok(())
    }

    /// Error handler for controller
    fn error_policy(route: Arc<HTTPRoute>, error: &Error, ctx: Arc<Context>) -> Action {
        log_failure("HTTPRoute", &route_key(&route), error);
        Action::requeue(ctx.config.timeouts.error_requeue())
    }

    /// Start the HTTPRoute controller
    pub async fn run(self) -> Result<()> {
        let api: Api<HTTPRoute> = Api::all(self.client.clone());

        info!("Starting HTTPRoute controller");

        Controller::new(api, WatcherConfig::default())
            .run(Self::reconcile, Self::error_policy, self.ctx)
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled HTTPRoute: {:?}", o),
                    Err(e) => debug!("HTTPRoute reconcile pass failed: {}", e),
                }
            })
            .await;

        error!("HTTPRoute controller stream ended");
        Ok(())
    }
}

fn has_finalizer(route: &HTTPRoute) -> bool {
    route.finalizers().iter().any(|f| f == ROUTE_FINALIZER)
}

fn status_parents(route: &HTTPRoute) -> Vec<Value> {
    route
        .status
        .as_ref()
        .and_then(|status| serde_json::to_value(status).ok())
        .and_then(|value| value.get("parents").and_then(Value::as_array).cloned())
        .unwrap_or_default()
}
