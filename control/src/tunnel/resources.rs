//! Kubernetes objects backing one Gateway's tunnel
//!
//! - ConfigMap `<gateway>-config`: `config.yaml` (tunnel config), `owners.json` (rule ledger)
//! - Secret `<gateway>-secret`: `creds.json` (tunnel credentials)
//! - Deployment `<gateway>`: the cloudflared connector

use crate::error::Result;
use crate::tunnel::merge::RuleOwners;
use common::{TunnelConfig, TunnelCredentials};
use gateway_api::apis::standard::gateways::Gateway;
use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction, KeyToPath, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, Secret, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// ConfigMap key holding the serialized tunnel config
pub const CONFIG_KEY: &str = "config.yaml";

/// ConfigMap key holding the hostname ownership ledger
pub const OWNERS_KEY: &str = "owners.json";

/// Secret key holding the serialized tunnel credentials
pub const CREDENTIALS_KEY: &str = "creds.json";

/// Label tying every generated object to its Gateway
pub const GATEWAY_LABEL: &str = "tunnelgate.io/gateway";

/// Pod template annotation; changes whenever the persisted config changes
pub const CONFIG_CHECKSUM_ANNOTATION: &str = "tunnelgate.io/config-checksum";

/// Pod template annotation naming the tunnel the connector serves
pub const TUNNEL_ID_ANNOTATION: &str = "tunnelgate.io/tunnel-id";

/// Connector metrics/readiness port
pub const METRICS_PORT: i32 = 2000;

const CONNECTOR_CONTAINER: &str = "cloudflared";
const CONFIG_MOUNT_PATH: &str = "/etc/cloudflared/config";
const CREDENTIALS_MOUNT_PATH: &str = "/etc/cloudflared/creds";

pub fn config_map_name(gateway: &str) -> String {
    format!("{gateway}-config")
}

pub fn secret_name(gateway: &str) -> String {
    format!("{gateway}-secret")
}

fn labels(gateway: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(GATEWAY_LABEL.to_string(), gateway.to_string())])
}

/// Metadata shared by every generated object, owned by the Gateway so
/// deleting the Gateway garbage-collects them
fn object_meta(gateway: &Gateway, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: gateway.namespace(),
        labels: Some(labels(&gateway.name_any())),
        owner_references: gateway.controller_owner_ref(&()).map(|owner| vec![owner]),
        ..Default::default()
    }
}

/// SHA-256 of the persisted config, hex encoded
pub fn config_checksum(raw_config: &str) -> String {
    hex::encode(Sha256::digest(raw_config.as_bytes()))
}

/// Raw `config.yaml` contents, if present
pub fn read_config(config_map: &ConfigMap) -> Option<&str> {
    config_map
        .data
        .as_ref()
        .and_then(|data| data.get(CONFIG_KEY))
        .map(String::as_str)
}

/// Ownership ledger; absent or unreadable ledgers are empty
pub fn read_owners(config_map: &ConfigMap) -> RuleOwners {
    config_map
        .data
        .as_ref()
        .and_then(|data| data.get(OWNERS_KEY))
        .and_then(|raw| RuleOwners::from_json(raw).ok())
        .unwrap_or_default()
}

/// Write the config (and ledger) into `config_map`, keeping its metadata
pub fn write_config(config_map: &mut ConfigMap, config: &TunnelConfig, owners: &RuleOwners) {
    let data = config_map.data.get_or_insert_with(BTreeMap::new);
    data.insert(CONFIG_KEY.to_string(), config.to_json());
    data.insert(OWNERS_KEY.to_string(), owners.to_json());
}

pub fn build_config_map(gateway: &Gateway, config: &TunnelConfig) -> ConfigMap {
    ConfigMap {
        metadata: object_meta(gateway, config_map_name(&gateway.name_any())),
        data: Some(BTreeMap::from([(CONFIG_KEY.to_string(), config.to_json())])),
        ..Default::default()
    }
}

/// Credentials persisted in the Secret. `None` when the key is missing.
pub fn read_credentials(secret: &Secret) -> Option<Result<TunnelCredentials>> {
    let raw = secret
        .data
        .as_ref()
        .and_then(|data| data.get(CREDENTIALS_KEY))
        .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(CREDENTIALS_KEY))
                .cloned()
        })?;
    Some(TunnelCredentials::from_json(&raw).map_err(Into::into))
}

pub fn build_credential_secret(gateway: &Gateway, credentials: &TunnelCredentials) -> Secret {
    Secret {
        metadata: object_meta(gateway, secret_name(&gateway.name_any())),
        data: Some(BTreeMap::from([(
            CREDENTIALS_KEY.to_string(),
            ByteString(credentials.to_json().into_bytes()),
        )])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

fn resource_list(memory: &str, cpu: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("memory".to_string(), Quantity(memory.to_string())),
        ("cpu".to_string(), Quantity(cpu.to_string())),
    ])
}

/// Connector Deployment
///
/// Single replica, rolled new-before-old so a config change never drops
/// the tunnel. The liveness probe fails after one miss so a broken
/// config/credential pair is restarted quickly.
pub fn build_deployment(
    gateway: &Gateway,
    image: &str,
    tunnel_id: &str,
    config_checksum: &str,
) -> Deployment {
    let name = gateway.name_any();
    let labels = labels(&name);

    let container = Container {
        name: CONNECTOR_CONTAINER.to_string(),
        image: Some(image.to_string()),
        args: Some(
            [
                "tunnel",
                "--protocol",
                "auto",
                "--config",
                common::CONFIG_FILE_PATH,
                "--metrics",
                "0.0.0.0:2000",
                "run",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        ),
        ports: Some(vec![ContainerPort {
            name: Some("metrics".to_string()),
            container_port: METRICS_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        liveness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/ready".to_string()),
                port: IntOrString::Int(METRICS_PORT),
                ..Default::default()
            }),
            failure_threshold: Some(1),
            initial_delay_seconds: Some(10),
            period_seconds: Some(10),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "config".to_string(),
                mount_path: CONFIG_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "creds".to_string(),
                mount_path: CREDENTIALS_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        resources: Some(ResourceRequirements {
            requests: Some(resource_list("30Mi", "10m")),
            limits: Some(resource_list("256Mi", "500m")),
            ..Default::default()
        }),
        ..Default::default()
    };

    let volumes = vec![
        Volume {
            name: "config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map_name(&name),
                items: Some(vec![KeyToPath {
                    key: CONFIG_KEY.to_string(),
                    path: CONFIG_KEY.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "creds".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret_name(&name)),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    let pod_annotations = BTreeMap::from([
        (
            CONFIG_CHECKSUM_ANNOTATION.to_string(),
            config_checksum.to_string(),
        ),
        (TUNNEL_ID_ANNOTATION.to_string(), tunnel_id.to_string()),
    ]);

    Deployment {
        metadata: object_meta(gateway, name),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_surge: Some(IntOrString::Int(1)),
                    max_unavailable: Some(IntOrString::Int(0)),
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
