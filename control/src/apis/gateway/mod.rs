//! Gateway API support (v1)
//!
//! Three independent reconcilers:
//! - GatewayClass: validates the credential Secret and token, sets Accepted
//! - Gateway: provisions the tunnel, credentials, config and connector
//! - HTTPRoute: merges the route's rules into its Gateway's tunnel config

#[allow(clippy::module_inception)]
pub mod gateway;
pub mod gateway_class;
pub mod http_route;
pub mod ownership;
pub mod validator;

use crate::error::Error;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, warn};

/// Log a failed reconcile at the level its error deserves
pub(crate) fn log_failure(kind: &str, key: &str, err: &Error) {
    if err.is_conflict() {
        warn!("{} {} lost a write race, retrying: {}", kind, key, err);
    } else if let Error::AmbiguousExternalState { .. } = err {
        error!("{} {} needs operator attention: {}", kind, key, err);
    } else {
        error!("{} {} reconciliation failed: {}", kind, key, err);
    }
}

/// `conditions` of an object's status, as JSON
pub(crate) fn status_conditions<S: Serialize>(status: Option<&S>) -> Option<Value> {
    serde_json::to_value(status?).ok()?.get("conditions").cloned()
}

/// One status condition, timestamped now
pub(crate) fn condition(
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
    generation: Option<i64>,
) -> Value {
    json!({
        "type": type_,
        "status": if status { "True" } else { "False" },
        "reason": reason,
        "message": message,
        "lastTransitionTime": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "observedGeneration": generation.unwrap_or(0),
    })
}

/// Whether every desired condition is already present with the same
/// status, reason, message and generation
///
/// Status writes bump the resourceVersion and re-trigger the watch, so an
/// unchanged status must not be rewritten.
pub(crate) fn conditions_current(current: Option<&Value>, desired: &[Value]) -> bool {
    let Some(current) = current.and_then(Value::as_array) else {
        return false;
    };

    desired.iter().all(|want| {
        current.iter().any(|have| {
            ["type", "status", "reason", "message", "observedGeneration"]
                .iter()
                .all(|field| have.get(field) == want.get(field))
        })
    })
}
