//! Route merge engine
//!
//! Folds one HTTPRoute's rules into a Gateway's persisted tunnel config.
//!
//! Merge semantics per candidate rule, against the full set of hostnames
//! already present:
//! - hostname present, same service: no-op
//! - hostname present, different service: re-point in place
//! - hostname absent: append
//!
//! The result is re-sorted and re-validated, and only reported as changed
//! when its serialized bytes differ from what is persisted.
//!
//! Every hostname a route writes is recorded in a ledger (`owners.json`)
//! so the route's rules can be pruned when it drops a hostname or is
//! deleted. Rules nobody claimed are never pruned.

use common::{sort_rules, ConfigError, IngressRule, TunnelConfig, DEFAULT_CATCH_ALL_SERVICE};
use gateway_api::apis::standard::httproutes::HTTPRoute;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// Result of merging into a persisted config
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Serialized form identical to what is persisted; nothing to write
    Unchanged,
    Changed(TunnelConfig),
}

/// Hostname -> `namespace/route` that last wrote it. The catch-all is keyed by `""`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleOwners(BTreeMap<String, String>);

impl RuleOwners {
    pub fn owner(&self, hostname: &str) -> Option<&str> {
        self.0.get(hostname).map(String::as_str)
    }

    pub fn claim(&mut self, hostname: &str, route: &str) {
        self.0.insert(hostname.to_string(), route.to_string());
    }

    pub fn release(&mut self, hostname: &str) {
        self.0.remove(hostname);
    }

    /// Hostnames currently owned by `route`
    pub fn owned_by(&self, route: &str) -> BTreeSet<String> {
        self.0
            .iter()
            .filter(|(_, owner)| owner.as_str() == route)
            .map(|(hostname, _)| hostname.clone())
            .collect()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Config and ledger to persist together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteWrite {
    pub config: TunnelConfig,
    pub owners: RuleOwners,
}

/// Ledger key for a route
pub fn route_key(route: &HTTPRoute) -> String {
    format!(
        "{}/{}",
        route.namespace().unwrap_or_else(|| "default".to_string()),
        route.name_any()
    )
}

/// Cluster-local URL for a Service backend
pub fn service_url(name: &str, namespace: &str, port: i32) -> String {
    format!("http://{name}.{namespace}.svc.cluster.local:{port}")
}

/// Rules one route contributes
///
/// The backend is the first backendRef of the first rule that has one.
/// Each declared hostname gets a rule to it; a route without hostnames
/// becomes the catch-all. A route without any backendRef contributes nothing.
pub fn build_fragment(route: &HTTPRoute) -> Vec<IngressRule> {
    let route_namespace = route.namespace().unwrap_or_else(|| "default".to_string());

    let backend = route
        .spec
        .rules
        .iter()
        .flatten()
        .filter_map(|rule| rule.backend_refs.as_ref())
        .flatten()
        .next();

    let Some(backend) = backend else {
        warn!(
            "HTTPRoute {}/{} has no backendRefs, ignoring",
            route_namespace,
            route.name_any()
        );
        return Vec::new();
    };

    let namespace = backend.namespace.as_deref().unwrap_or(&route_namespace);
    let service = service_url(&backend.name, namespace, backend.port.unwrap_or(80));

    let hostnames: BTreeSet<&str> = route
        .spec
        .hostnames
        .iter()
        .flatten()
        .map(String::as_str)
        .filter(|h| !h.is_empty())
        .collect();

    if hostnames.is_empty() {
        return vec![IngressRule::catch_all(service)];
    }

    hostnames
        .into_iter()
        .map(|hostname| IngressRule::new(hostname, service.clone()))
        .collect()
}

/// Fold `fragment` into `rules`. New hostnames are decided against the whole
/// existing set, built once up front.
fn fold_fragment(mut rules: Vec<IngressRule>, fragment: &[IngressRule]) -> Vec<IngressRule> {
    let mut index: HashMap<String, usize> = rules
        .iter()
        .enumerate()
        .map(|(i, rule)| (rule.host().to_string(), i))
        .collect();

    for candidate in fragment {
        match index.get(candidate.host()) {
            Some(&i) if rules[i].service != candidate.service => {
                debug!(
                    "Re-pointing {:?}: {} -> {}",
                    candidate.host(),
                    rules[i].service,
                    candidate.service
                );
                rules[i].service = candidate.service.clone();
            }
            Some(_) => {}
            None => {
                index.insert(candidate.host().to_string(), rules.len());
                rules.push(candidate.clone());
            }
        }
    }

    rules
}

/// Drop the rules for `hostnames`. A dropped catch-all falls back to 404.
fn prune(rules: Vec<IngressRule>, hostnames: &BTreeSet<String>) -> Vec<IngressRule> {
    rules
        .into_iter()
        .filter_map(|rule| {
            if !hostnames.contains(rule.host()) {
                Some(rule)
            } else if rule.is_catch_all() {
                Some(IngressRule::catch_all(DEFAULT_CATCH_ALL_SERVICE))
            } else {
                None
            }
        })
        .collect()
}

fn rebuild(tunnel_id: &str, rules: Vec<IngressRule>) -> Result<TunnelConfig, ConfigError> {
    TunnelConfig::new(tunnel_id, sort_rules(rules))
}

/// Merge one fragment into the persisted config
pub fn merge(persisted_raw: &str, fragment: &[IngressRule]) -> Result<MergeOutcome, ConfigError> {
    let persisted = TunnelConfig::from_json(persisted_raw)?;
    let tunnel_id = persisted.tunnel_id().to_string();

    let merged = rebuild(&tunnel_id, fold_fragment(persisted.into_rules(), fragment))?;

    if merged.to_json() == persisted_raw {
        Ok(MergeOutcome::Unchanged)
    } else {
        Ok(MergeOutcome::Changed(merged))
    }
}

/// Apply a live route: prune hostnames it no longer declares, merge its
/// fragment, and record it as owner of every hostname it wrote.
///
/// `None` when neither the config bytes nor the ledger change.
pub fn apply_route(
    persisted_raw: &str,
    owners: &RuleOwners,
    route: &str,
    fragment: &[IngressRule],
) -> Result<Option<RouteWrite>, ConfigError> {
    let declared: BTreeSet<String> = fragment.iter().map(|r| r.host().to_string()).collect();
    let stale: BTreeSet<String> = owners
        .owned_by(route)
        .into_iter()
        .filter(|hostname| !declared.contains(hostname))
        .collect();

    let base = if stale.is_empty() {
        persisted_raw.to_string()
    } else {
        let persisted = TunnelConfig::from_json(persisted_raw)?;
        let tunnel_id = persisted.tunnel_id().to_string();
        rebuild(&tunnel_id, prune(persisted.into_rules(), &stale))?.to_json()
    };

    let mut next_owners = owners.clone();
    for hostname in &stale {
        next_owners.release(hostname);
    }
    for hostname in &declared {
        if let Some(previous) = next_owners.owner(hostname).filter(|owner| *owner != route) {
            debug!("{} takes over {:?} from {}", route, hostname, previous);
        }
        next_owners.claim(hostname, route);
    }

    let config = match merge(&base, fragment)? {
        MergeOutcome::Changed(config) => config,
        MergeOutcome::Unchanged if base == persisted_raw && &next_owners == owners => {
            return Ok(None)
        }
        MergeOutcome::Unchanged => TunnelConfig::from_json(&base)?,
    };

    Ok(Some(RouteWrite {
        config,
        owners: next_owners,
    }))
}

/// Remove every rule `route` owns. `None` when it owns nothing.
pub fn remove_route(
    persisted_raw: &str,
    owners: &RuleOwners,
    route: &str,
) -> Result<Option<RouteWrite>, ConfigError> {
    let owned = owners.owned_by(route);
    if owned.is_empty() {
        return Ok(None);
    }

    let persisted = TunnelConfig::from_json(persisted_raw)?;
    let tunnel_id = persisted.tunnel_id().to_string();
    let config = rebuild(&tunnel_id, prune(persisted.into_rules(), &owned))?;

    let mut next_owners = owners.clone();
    for hostname in &owned {
        next_owners.release(hostname);
    }

    Ok(Some(RouteWrite {
        config,
        owners: next_owners,
    }))
}
