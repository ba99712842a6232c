//! Ownership filter
//!
//! Decides whether an observed object belongs to this controller by walking
//! route -> Gateway -> GatewayClass and comparing the class's controllerName.
//! Nothing is cached; every check reads the chain fresh.

use crate::error::Result;
use crate::store::ClusterStore;
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use gateway_api::apis::standard::gateways::Gateway;
use gateway_api::apis::standard::httproutes::HTTPRoute;
use kube::ResourceExt;
use tracing::debug;

/// The object kinds that can be owned
#[derive(Debug, Clone, Copy)]
pub enum OwnedObject<'a> {
    GatewayClass(&'a GatewayClass),
    Gateway(&'a Gateway),
    HttpRoute(&'a HTTPRoute),
}

impl OwnedObject<'_> {
    /// Name of the GatewayClass the object belongs to
    ///
    /// For a route this resolves its first parent Gateway; `None` if the
    /// route has no parent or the parent does not exist.
    pub async fn class_reference(&self, store: &dyn ClusterStore) -> Result<Option<String>> {
        match self {
            OwnedObject::GatewayClass(class) => Ok(Some(class.name_any())),
            OwnedObject::Gateway(gateway) => Ok(Some(gateway.spec.gateway_class_name.clone())),
            OwnedObject::HttpRoute(route) => Ok(parent_gateway(store, route)
                .await?
                .map(|gateway| gateway.spec.gateway_class_name)),
        }
    }
}

/// First parentRef of a route as `(namespace, name)`; namespace defaults to the route's
pub fn parent_ref(route: &HTTPRoute) -> Option<(String, String)> {
    let parent = route.spec.parent_refs.as_ref()?.first()?;
    let namespace = parent
        .namespace
        .clone()
        .or_else(|| route.namespace())
        .unwrap_or_else(|| "default".to_string());
    Some((namespace, parent.name.clone()))
}

/// The Gateway a route attaches to, if it exists
pub async fn parent_gateway(store: &dyn ClusterStore, route: &HTTPRoute) -> Result<Option<Gateway>> {
    let Some((namespace, name)) = parent_ref(route) else {
        return Ok(None);
    };
    store.get_gateway(&namespace, &name).await
}

/// The owning GatewayClass, when `object` is ours
///
/// A missing class (or parent) is "not ours", not an error. Store
/// failures are returned so the caller retries.
pub async fn owning_class(
    store: &dyn ClusterStore,
    controller_name: &str,
    object: &OwnedObject<'_>,
) -> Result<Option<GatewayClass>> {
    let class = match object {
        OwnedObject::GatewayClass(class) => Some((*class).clone()),
        _ => match object.class_reference(store).await? {
            Some(class_name) => store.get_gateway_class(&class_name).await?,
            None => None,
        },
    };

    Ok(class.filter(|class| {
        let owned = class.spec.controller_name == controller_name;
        if !owned {
            debug!(
                "GatewayClass {} belongs to controller '{}'",
                class.name_any(),
                class.spec.controller_name
            );
        }
        owned
    }))
}

/// Whether `object` belongs to this controller
pub async fn is_owned(
    store: &dyn ClusterStore,
    controller_name: &str,
    object: &OwnedObject<'_>,
) -> Result<bool> {
    Ok(owning_class(store, controller_name, object).await?.is_some())
}
