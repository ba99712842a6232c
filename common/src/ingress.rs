//! Ingress rules and their canonical order
//!
//! The connector matches rules top to bottom, so the order matters:
//! - exact hostnames first (`a.example.com`)
//! - wildcard hostnames next (`*.example.com`)
//! - the catch-all (no hostname) last, always

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A single ingress rule: hostname (optional) -> service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    /// Hostname to match. `None` (or empty) matches everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Target, e.g. `http://web.default.svc.cluster.local:80` or `http_status:404`
    pub service: String,
}

impl IngressRule {
    /// Create a rule for a hostname. An empty hostname yields a catch-all.
    pub fn new(hostname: impl Into<String>, service: impl Into<String>) -> Self {
        let hostname = hostname.into();
        Self {
            hostname: if hostname.is_empty() {
                None
            } else {
                Some(hostname)
            },
            service: service.into(),
        }
    }

    /// Create a catch-all rule
    pub fn catch_all(service: impl Into<String>) -> Self {
        Self {
            hostname: None,
            service: service.into(),
        }
    }

    /// Hostname as a string slice (`""` for the catch-all)
    #[inline]
    pub fn host(&self) -> &str {
        self.hostname.as_deref().unwrap_or("")
    }

    #[inline]
    pub fn is_catch_all(&self) -> bool {
        self.host().is_empty()
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        self.host().starts_with("*.")
    }
}

/// Compare two rules by (catch-all, wildcard, hostname)
fn compare(a: &IngressRule, b: &IngressRule) -> Ordering {
    a.is_catch_all()
        .cmp(&b.is_catch_all())
        .then_with(|| a.is_wildcard().cmp(&b.is_wildcard()))
        .then_with(|| a.host().cmp(b.host()))
}

/// Sort rules into the order the connector expects
///
/// Stable: rules with the same hostname keep their relative input order.
pub fn sort_rules(mut rules: Vec<IngressRule>) -> Vec<IngressRule> {
    rules.sort_by(compare);

    // Catch-all must be physically last, whatever the comparator did
    if let Some(pos) = rules.iter().position(IngressRule::is_catch_all) {
        if pos != rules.len() - 1 {
            let catch_all = rules.remove(pos);
            rules.push(catch_all);
        }
    }

    rules
}
