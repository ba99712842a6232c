//! Kubernetes API integrations
//!
//! Reconcilers for the Gateway API (v1) objects this controller owns.

pub mod gateway;
pub mod metrics;
