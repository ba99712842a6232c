//! Per-Gateway tunnel management
//!
//! `lifecycle` provisions the tunnel and its Kubernetes objects, `merge`
//! folds routes into the tunnel config, `resources` builds the objects.

pub mod lifecycle;
pub mod merge;
pub mod resources;
