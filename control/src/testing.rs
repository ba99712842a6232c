//! In-memory fakes and fixtures shared by the unit tests

use crate::error::{Error, Result};
use crate::provider::{ClassCredentialConfig, ProviderFactory, TokenVerifier, Tunnel, TunnelProvider};
use crate::store::ClusterStore;
use crate::tunnel::resources::{config_map_name, read_config, write_config};
use crate::tunnel::merge::RuleOwners;
use async_trait::async_trait;
use common::TunnelConfig;
use gateway_api::apis::standard::gatewayclasses::{
    GatewayClass, GatewayClassParametersRef, GatewayClassSpec,
};
use gateway_api::apis::standard::gateways::{Gateway, GatewaySpec};
use gateway_api::apis::standard::httproutes::{
    HTTPRoute, HTTPRouteParentRefs, HTTPRouteRules, HTTPRouteRulesBackendRefs, HTTPRouteSpec,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::core::ErrorResponse;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

pub fn api_error(code: u16, reason: &str, message: &str) -> Error {
    Error::Kubernetes(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

/// RFC 7386 JSON merge patch
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    let map = target.as_object_mut().unwrap();
    for (field, value) in patch {
        if value.is_null() {
            map.remove(field);
        } else {
            merge_patch(map.entry(field.clone()).or_insert(Value::Null), value);
        }
    }
}

#[derive(Default)]
struct State {
    version: u64,
    classes: BTreeMap<String, GatewayClass>,
    gateways: BTreeMap<Key, Gateway>,
    routes: BTreeMap<Key, HTTPRoute>,
    secrets: BTreeMap<Key, Secret>,
    config_maps: BTreeMap<Key, ConfigMap>,
    deployments: BTreeMap<Key, Deployment>,
    statuses: BTreeMap<(&'static str, Key), Value>,
    status_writes: usize,
    config_map_writes: usize,
}

impl State {
    fn next_version(&mut self) -> Option<String> {
        self.version += 1;
        Some(self.version.to_string())
    }
}

/// API-server-like store: resource versions, 409 on stale writes, 404 on missing
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn put_gateway_class(&self, mut class: GatewayClass) {
        let mut state = self.state.lock().unwrap();
        class.metadata.resource_version = state.next_version();
        state.classes.insert(class.name_any(), class);
    }

    pub fn put_gateway(&self, mut gateway: Gateway) {
        let mut state = self.state.lock().unwrap();
        gateway.metadata.resource_version = state.next_version();
        let k = key(&gateway.namespace().unwrap_or_default(), &gateway.name_any());
        state.gateways.insert(k, gateway);
    }

    pub fn put_route(&self, mut route: HTTPRoute) {
        let mut state = self.state.lock().unwrap();
        route.metadata.resource_version = state.next_version();
        let k = key(&route.namespace().unwrap_or_default(), &route.name_any());
        state.routes.insert(k, route);
    }

    pub fn put_secret(&self, mut secret: Secret) {
        let mut state = self.state.lock().unwrap();
        secret.metadata.resource_version = state.next_version();
        let k = key(&secret.namespace().unwrap_or_default(), &secret.name_any());
        state.secrets.insert(k, secret);
    }

    /// Overwrite the persisted config of `gateway`, keeping its ledger
    pub fn put_config(&self, namespace: &str, gateway: &str, config: &TunnelConfig) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let k = key(namespace, &config_map_name(gateway));
        let config_map = state.config_maps.entry(k).or_insert_with(|| ConfigMap {
            metadata: ObjectMeta {
                name: Some(config_map_name(gateway)),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        let owners = crate::tunnel::resources::read_owners(config_map);
        write_config(config_map, config, &owners);
        config_map.metadata.resource_version = version;
    }

    pub fn gateway(&self, namespace: &str, name: &str) -> Option<Gateway> {
        self.state.lock().unwrap().gateways.get(&key(namespace, name)).cloned()
    }

    pub fn route(&self, namespace: &str, name: &str) -> Option<HTTPRoute> {
        self.state.lock().unwrap().routes.get(&key(namespace, name)).cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.state.lock().unwrap().secrets.get(&key(namespace, name)).cloned()
    }

    pub fn config_map(&self, namespace: &str, gateway: &str) -> Option<ConfigMap> {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .get(&key(namespace, &config_map_name(gateway)))
            .cloned()
    }

    /// Parsed tunnel config of `gateway`
    pub fn config(&self, namespace: &str, gateway: &str) -> Option<TunnelConfig> {
        let config_map = self.config_map(namespace, gateway)?;
        read_config(&config_map).map(|raw| TunnelConfig::from_json(raw).unwrap())
    }

    pub fn owners(&self, namespace: &str, gateway: &str) -> RuleOwners {
        self.config_map(namespace, gateway)
            .map(|cm| crate::tunnel::resources::read_owners(&cm))
            .unwrap_or_default()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.state.lock().unwrap().deployments.get(&key(namespace, name)).cloned()
    }

    /// Last status written for `kind` (`"GatewayClass"`, `"Gateway"`, `"HTTPRoute"`)
    pub fn status(&self, kind: &'static str, namespace: &str, name: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .statuses
            .get(&(kind, key(namespace, name)))
            .cloned()
    }

    pub fn status_writes(&self) -> usize {
        self.state.lock().unwrap().status_writes
    }

    /// Config write-backs after creation
    pub fn config_map_writes(&self) -> usize {
        self.state.lock().unwrap().config_map_writes
    }

    fn create<T>(map: &mut BTreeMap<Key, T>, version: Option<String>, namespace: &str, mut obj: T) -> Result<()>
    where
        T: Resource,
    {
        let k = key(namespace, &obj.meta().name.clone().unwrap_or_default());
        if map.contains_key(&k) {
            return Err(api_error(409, "AlreadyExists", "object already exists"));
        }
        obj.meta_mut().namespace = Some(namespace.to_string());
        obj.meta_mut().resource_version = version;
        map.insert(k, obj);
        Ok(())
    }

    fn replace<T>(map: &mut BTreeMap<Key, T>, version: Option<String>, namespace: &str, mut obj: T) -> Result<()>
    where
        T: Resource,
    {
        let k = key(namespace, &obj.meta().name.clone().unwrap_or_default());
        let Some(current) = map.get(&k) else {
            return Err(api_error(404, "NotFound", "object not found"));
        };
        let expected = &obj.meta().resource_version;
        if expected.is_some() && expected != &current.meta().resource_version {
            return Err(api_error(409, "Conflict", "the object has been modified"));
        }
        obj.meta_mut().resource_version = version;
        map.insert(k, obj);
        Ok(())
    }

    fn patch_metadata<T>(map: &mut BTreeMap<Key, T>, version: Option<String>, k: Key, patch: &Value) -> Result<()>
    where
        T: Resource + Serialize + DeserializeOwned,
    {
        let Some(current) = map.get(&k) else {
            return Err(api_error(404, "NotFound", "object not found"));
        };
        if let Some(expected) = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
            if Some(expected) != current.meta().resource_version.as_deref() {
                return Err(api_error(409, "Conflict", "the object has been modified"));
            }
        }
        let mut value = serde_json::to_value(current).unwrap();
        merge_patch(&mut value, patch);
        let mut patched: T = serde_json::from_value(value).unwrap();
        patched.meta_mut().resource_version = version;
        map.insert(k, patched);
        Ok(())
    }

    fn record_status(&self, kind: &'static str, namespace: &str, name: &str, status: &Value) {
        let mut state = self.state.lock().unwrap();
        state.status_writes += 1;
        let status = status.get("status").cloned().unwrap_or(Value::Null);
        state.statuses.insert((kind, key(namespace, name)), status);
    }
}

#[async_trait]
impl ClusterStore for InMemoryStore {
    async fn get_gateway_class(&self, name: &str) -> Result<Option<GatewayClass>> {
        Ok(self.state.lock().unwrap().classes.get(name).cloned())
    }

    async fn get_gateway(&self, namespace: &str, name: &str) -> Result<Option<Gateway>> {
        Ok(self.gateway(namespace, name))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.secret(namespace, name))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        Self::create(&mut state.secrets, version, namespace, secret.clone())
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        Self::replace(&mut state.secrets, version, namespace, secret.clone())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .config_maps
            .get(&key(namespace, name))
            .cloned())
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        Self::create(&mut state.config_maps, version, namespace, config_map.clone())
    }

    async fn replace_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        Self::replace(&mut state.config_maps, version, namespace, config_map.clone())?;
        state.config_map_writes += 1;
        Ok(())
    }

    async fn apply_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut deployment = deployment.clone();
        deployment.metadata.resource_version = state.next_version();
        state
            .deployments
            .insert(key(namespace, &deployment.name_any()), deployment);
        Ok(())
    }

    async fn patch_gateway_metadata(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        Self::patch_metadata(&mut state.gateways, version, key(namespace, name), patch)
    }

    async fn patch_http_route_metadata(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        Self::patch_metadata(&mut state.routes, version, key(namespace, name), patch)
    }

    async fn patch_gateway_class_status(&self, name: &str, status: &Value) -> Result<()> {
        self.record_status("GatewayClass", "", name, status);
        Ok(())
    }

    async fn patch_gateway_status(&self, namespace: &str, name: &str, status: &Value) -> Result<()> {
        self.record_status("Gateway", namespace, name, status);
        Ok(())
    }

    async fn patch_http_route_status(
        &self,
        namespace: &str,
        name: &str,
        status: &Value,
    ) -> Result<()> {
        self.record_status("HTTPRoute", namespace, name, status);
        Ok(())
    }
}

/// Tunnel provider backed by a list. With a race window, every list call
/// yields after taking its snapshot so concurrent callers interleave.
#[derive(Default)]
pub struct InMemoryProvider {
    tunnels: Mutex<Vec<Tunnel>>,
    deleted: Mutex<Vec<String>>,
    next_id: AtomicUsize,
    creates: AtomicUsize,
    race_window: bool,
}

impl InMemoryProvider {
    pub fn with_race_window() -> Self {
        Self {
            race_window: true,
            ..Default::default()
        }
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn tunnel_count(&self, name: &str) -> usize {
        self.tunnels
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.name == name)
            .count()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    /// Simulate an out-of-band delete
    pub fn remove_all(&self, name: &str) {
        self.tunnels.lock().unwrap().retain(|t| t.name != name);
    }
}

#[async_trait]
impl TunnelProvider for InMemoryProvider {
    async fn list_tunnels(&self, name: &str) -> Result<Vec<Tunnel>> {
        let snapshot: Vec<Tunnel> = self
            .tunnels
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.name == name)
            .cloned()
            .collect();
        if self.race_window {
            tokio::task::yield_now().await;
        }
        Ok(snapshot)
    }

    async fn create_tunnel(&self, name: &str, _secret: &str) -> Result<Tunnel> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let tunnel = Tunnel {
            id: format!("tunnel-{id}"),
            name: name.to_string(),
            created_at: None,
            deleted_at: None,
        };
        self.tunnels.lock().unwrap().push(tunnel.clone());
        Ok(tunnel)
    }

    async fn delete_tunnel(&self, tunnel_id: &str) -> Result<()> {
        self.tunnels.lock().unwrap().retain(|t| t.id != tunnel_id);
        self.deleted.lock().unwrap().push(tunnel_id.to_string());
        Ok(())
    }
}

/// Verifier accepting every token
pub struct AcceptAllTokens;

#[async_trait]
impl TokenVerifier for AcceptAllTokens {
    async fn verify_token(&self, _token: &str) -> Result<()> {
        Ok(())
    }
}

/// Factory handing out fixed provider clients
pub struct InMemoryProviders {
    pub provider: Arc<InMemoryProvider>,
    verifier: Arc<dyn TokenVerifier>,
}

impl InMemoryProviders {
    pub fn new(provider: Arc<InMemoryProvider>, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { provider, verifier }
    }

    pub fn accepting(provider: Arc<InMemoryProvider>) -> Self {
        Self::new(provider, Arc::new(AcceptAllTokens))
    }
}

impl ProviderFactory for InMemoryProviders {
    fn token_verifier(&self) -> Arc<dyn TokenVerifier> {
        self.verifier.clone()
    }

    fn tunnel_provider(&self, _config: &ClassCredentialConfig) -> Result<Arc<dyn TunnelProvider>> {
        Ok(self.provider.clone())
    }
}

pub fn gateway_class(name: &str, controller: &str, secret: Option<(&str, &str)>) -> GatewayClass {
    GatewayClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec: GatewayClassSpec {
            controller_name: controller.to_string(),
            parameters_ref: secret.map(|(namespace, name)| GatewayClassParametersRef {
                group: String::new(),
                kind: "Secret".to_string(),
                name: name.to_string(),
                namespace: Some(namespace.to_string()),
            }),
            ..Default::default()
        },
        status: None,
    }
}

pub fn gateway(namespace: &str, name: &str, class: &str) -> Gateway {
    Gateway {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{name}")),
            generation: Some(1),
            ..Default::default()
        },
        spec: GatewaySpec {
            gateway_class_name: class.to_string(),
            ..Default::default()
        },
        status: None,
    }
}

/// Route on port 80 of `backend` in the route's namespace
pub fn http_route(
    namespace: &str,
    name: &str,
    parent: &str,
    hostnames: &[&str],
    backend: Option<&str>,
) -> HTTPRoute {
    HTTPRoute {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec: HTTPRouteSpec {
            parent_refs: Some(vec![HTTPRouteParentRefs {
                name: parent.to_string(),
                ..Default::default()
            }]),
            hostnames: Some(hostnames.iter().map(|h| h.to_string()).collect()),
            rules: Some(vec![HTTPRouteRules {
                backend_refs: backend.map(|service| {
                    vec![HTTPRouteRulesBackendRefs {
                        name: service.to_string(),
                        port: Some(80),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }]),
            ..Default::default()
        },
        status: None,
    }
}

/// Credential Secret with every key populated
pub fn credential_secret(namespace: &str, name: &str, token: &str) -> Secret {
    let data = [
        (ClassCredentialConfig::API_TOKEN_KEY, token),
        (ClassCredentialConfig::DOMAIN_KEY, "example.com"),
        (ClassCredentialConfig::EMAIL_KEY, "ops@example.com"),
        (ClassCredentialConfig::ACCOUNT_ID_KEY, "acct-1"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
    .collect();

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}
