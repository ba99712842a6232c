//! tunnelgate control plane library
//!
//! Gateway API reconcilers that expose cluster Services through
//! provider-managed tunnels.

pub mod apis;
pub mod config;
pub mod context;
pub mod error;
pub mod provider;
pub mod server;
pub mod store;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;
