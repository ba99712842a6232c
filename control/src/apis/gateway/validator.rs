//! GatewayClass validation
//!
//! A class is accepted when its parametersRef names a Secret holding all
//! four credential keys and the API token passes provider introspection.
//! The verdict is recomputed on every reconcile.

use crate::error::{Error, Result};
use crate::provider::{ClassCredentialConfig, TokenVerifier};
use crate::store::ClusterStore;
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use kube::ResourceExt;
use tracing::debug;

/// Outcome of validating a class
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassVerdict {
    Accepted,
    Rejected(String),
}

/// First missing credential field, in declaration order
pub fn validate_fields(config: &ClassCredentialConfig) -> Result<()> {
    let fields = [
        (ClassCredentialConfig::API_TOKEN_KEY, &config.api_token),
        (ClassCredentialConfig::DOMAIN_KEY, &config.domain),
        (ClassCredentialConfig::EMAIL_KEY, &config.email),
        (ClassCredentialConfig::ACCOUNT_ID_KEY, &config.account_id),
    ];

    match fields.into_iter().find(|(_, value)| value.is_empty()) {
        Some((name, _)) => Err(Error::MissingField(name)),
        None => Ok(()),
    }
}

pub async fn validate_token(verifier: &dyn TokenVerifier, token: &str) -> Result<()> {
    verifier.verify_token(token).await
}

/// Resolve the class's parametersRef and read the credentials it names
///
/// `default_namespace` applies when the reference carries no namespace.
pub async fn load_class_config(
    store: &dyn ClusterStore,
    class: &GatewayClass,
    default_namespace: &str,
) -> Result<ClassCredentialConfig> {
    let Some(params) = class.spec.parameters_ref.as_ref() else {
        return Err(Error::InvalidParameters(format!(
            "GatewayClass {} has no parametersRef",
            class.name_any()
        )));
    };

    if params.kind != "Secret" || !(params.group.is_empty() || params.group == "core") {
        return Err(Error::InvalidParameters(format!(
            "parametersRef must reference a core Secret, got {}/{}",
            params.group, params.kind
        )));
    }

    let namespace = params.namespace.as_deref().unwrap_or(default_namespace);
    let secret = store
        .get_secret(namespace, &params.name)
        .await?
        .ok_or_else(|| Error::MissingObject {
            kind: "Secret",
            name: format!("{}/{}", namespace, params.name),
        })?;

    let config = ClassCredentialConfig::from_secret(&secret);
    validate_fields(&config)?;
    Ok(config)
}

/// Validate a class end to end
///
/// Configuration problems and token rejections become `Rejected`. Anything
/// else (transport failures, timeouts, API server errors) is returned as an
/// error so a provider outage never flips an accepted class.
pub async fn evaluate(
    store: &dyn ClusterStore,
    verifier: &dyn TokenVerifier,
    class: &GatewayClass,
    default_namespace: &str,
) -> Result<ClassVerdict> {
    let checked = async {
        let config = load_class_config(store, class, default_namespace).await?;
        validate_token(verifier, &config.api_token).await
    };

    match checked.await {
        Ok(()) => Ok(ClassVerdict::Accepted),
        Err(e) if e.is_rejection() => {
            debug!("GatewayClass {} rejected: {}", class.name_any(), e);
            Ok(ClassVerdict::Rejected(e.to_string()))
        }
        Err(e) => Err(e),
    }
}
