//! Shared reconciler context
//!
//! The store and provider clients are passed in explicitly so reconcilers
//! hold no process-wide state and tests can substitute fakes.

use crate::config::ControllerConfig;
use crate::provider::ProviderFactory;
use crate::store::ClusterStore;
use std::sync::Arc;

/// Capabilities every reconciler receives
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn ClusterStore>,
    pub providers: Arc<dyn ProviderFactory>,
    pub config: ControllerConfig,
}

impl Context {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        providers: Arc<dyn ProviderFactory>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            providers,
            config,
        }
    }
}
