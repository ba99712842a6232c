//! Cluster store adapter
//!
//! Every Kubernetes read and write the reconcilers make goes through
//! `ClusterStore`. `KubeStore` backs it with a `kube::Client` and bounds each
//! call with the configured request timeout.

use crate::error::{Error, Result};
use async_trait::async_trait;
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use gateway_api::apis::standard::gateways::Gateway;
use gateway_api::apis::standard::httproutes::HTTPRoute;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Field manager for every write this controller makes
pub const FIELD_MANAGER: &str = "tunnelgate-controller";

/// Typed cluster reads and writes used by the reconcilers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_gateway_class(&self, name: &str) -> Result<Option<GatewayClass>>;

    async fn get_gateway(&self, namespace: &str, name: &str) -> Result<Option<Gateway>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()>;

    /// Replace; carries the object's resourceVersion, so a stale write fails with 409
    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<()>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()>;

    /// Replace; carries the object's resourceVersion, so a stale write fails with 409
    async fn replace_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()>;

    /// Server-side apply (create or replace)
    async fn apply_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()>;

    /// JSON merge patch against the Gateway's metadata
    async fn patch_gateway_metadata(&self, namespace: &str, name: &str, patch: &Value)
        -> Result<()>;

    /// JSON merge patch against the HTTPRoute's metadata
    async fn patch_http_route_metadata(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()>;

    async fn patch_gateway_class_status(&self, name: &str, status: &Value) -> Result<()>;

    async fn patch_gateway_status(&self, namespace: &str, name: &str, status: &Value)
        -> Result<()>;

    async fn patch_http_route_status(
        &self,
        namespace: &str,
        name: &str,
        status: &Value,
    ) -> Result<()>;
}

/// `ClusterStore` over the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    timeout: Duration,
}

impl KubeStore {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Run one API call under the request deadline
    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout {
                operation,
                timeout: self.timeout,
            }),
        }
    }

    fn merge_params() -> PatchParams {
        PatchParams::default()
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_gateway_class(&self, name: &str) -> Result<Option<GatewayClass>> {
        let api: Api<GatewayClass> = Api::all(self.client.clone());
        self.bounded("get gatewayclass", api.get_opt(name)).await
    }

    async fn get_gateway(&self, namespace: &str, name: &str) -> Result<Option<Gateway>> {
        let api: Api<Gateway> = Api::namespaced(self.client.clone(), namespace);
        self.bounded("get gateway", api.get_opt(name)).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        self.bounded("get secret", api.get_opt(name)).await
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        debug!("Creating Secret {}/{}", namespace, secret.name_any());
        self.bounded("create secret", api.create(&PostParams::default(), secret))
            .await?;
        Ok(())
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret.name_any();
        debug!("Replacing Secret {}/{}", namespace, name);
        self.bounded(
            "replace secret",
            api.replace(&name, &PostParams::default(), secret),
        )
        .await?;
        Ok(())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        self.bounded("get configmap", api.get_opt(name)).await
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        debug!("Creating ConfigMap {}/{}", namespace, config_map.name_any());
        self.bounded(
            "create configmap",
            api.create(&PostParams::default(), config_map),
        )
        .await?;
        Ok(())
    }

    async fn replace_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let name = config_map.name_any();
        debug!("Replacing ConfigMap {}/{}", namespace, name);
        self.bounded(
            "replace configmap",
            api.replace(&name, &PostParams::default(), config_map),
        )
        .await?;
        Ok(())
    }

    async fn apply_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let name = deployment.name_any();
        debug!("Applying Deployment {}/{}", namespace, name);
        self.bounded(
            "apply deployment",
            api.patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(deployment),
            ),
        )
        .await?;
        Ok(())
    }

    async fn patch_gateway_metadata(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        let api: Api<Gateway> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(
            "patch gateway",
            api.patch(name, &Self::merge_params(), &Patch::Merge(patch)),
        )
        .await?;
        Ok(())
    }

    async fn patch_http_route_metadata(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        let api: Api<HTTPRoute> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(
            "patch httproute",
            api.patch(name, &Self::merge_params(), &Patch::Merge(patch)),
        )
        .await?;
        Ok(())
    }

    async fn patch_gateway_class_status(&self, name: &str, status: &Value) -> Result<()> {
        let api: Api<GatewayClass> = Api::all(self.client.clone());
        self.bounded(
            "patch gatewayclass status",
            api.patch_status(name, &Self::merge_params(), &Patch::Merge(status)),
        )
        .await?;
        Ok(())
    }

    async fn patch_gateway_status(
        &self,
        namespace: &str,
        name: &str,
        status: &Value,
    ) -> Result<()> {
        let api: Api<Gateway> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(
            "patch gateway status",
            api.patch_status(name, &Self::merge_params(), &Patch::Merge(status)),
        )
        .await?;
        Ok(())
    }

    async fn patch_http_route_status(
        &self,
        namespace: &str,
        name: &str,
        status: &Value,
    ) -> Result<()> {
        let api: Api<HTTPRoute> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(
            "patch httproute status",
            api.patch_status(name, &Self::merge_params(), &Patch::Merge(status)),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_call_times_out() {
        // A client is needed to build the store; the call itself never touches it
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let client = Client::try_from(config).unwrap();
        let store = KubeStore::new(client, Duration::from_millis(10));

        let result: Result<()> = store
            .bounded("slow call", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(Error::Timeout {
                operation: "slow call",
                ..
            })
        ));
    }
}
