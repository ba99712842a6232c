//! GatewayClass watcher
//!
//! Validates owned GatewayClasses and reports the verdict as the
//! `Accepted` condition.

use crate::apis::gateway::ownership::{is_owned, OwnedObject};
use crate::apis::gateway::validator::{evaluate, ClassVerdict};
use crate::apis::gateway::{condition, conditions_current, log_failure, status_conditions};
use crate::apis::metrics::{record_reconciliation, ControlLoop};
use crate::context::Context;
use crate::error::{Error, Result};
use futures::StreamExt;
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// GatewayClass reconciler
pub struct GatewayClassReconciler {
    client: Client,
    ctx: Arc<Context>,
}

impl GatewayClassReconciler {
    pub fn new(client: Client, ctx: Arc<Context>) -> Self {
        Self { client, ctx }
    }

    /// Reconcile a single GatewayClass
    pub async fn reconcile(class: Arc<GatewayClass>, ctx: Arc<Context>) -> Result<Action> {
        let start = Instant::now();
        let result = Self::sync(&class, &ctx).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.metric_label(),
        };
        record_reconciliation(
            ControlLoop::GatewayClass,
            start.elapsed().as_secs_f64(),
            outcome,
        );
        result
    }

    async fn sync(class: &GatewayClass, ctx: &Context) -> Result<Action> {
        let name = class.name_any();
        let store = ctx.store.as_ref();

        if !is_owned(store, &ctx.config.controller_name, &OwnedObject::GatewayClass(class)).await? {
            debug!(
                "GatewayClass {} has controllerName '{}', ignoring",
                name, class.spec.controller_name
            );
            return Ok(Action::await_change());
        }

        info!("Reconciling GatewayClass: {}", name);

        let verifier = ctx.providers.token_verifier();
        let verdict = evaluate(
            store,
            verifier.as_ref(),
            class,
            &ctx.config.parameters_namespace,
        )
        .await?;

        Self::set_accepted_status(class, ctx, &verdict).await?;

        // Re-validated on a timer so a revoked or fixed token is noticed
        Ok(Action::requeue(ctx.config.timeouts.resync_interval()))
    }

    async fn set_accepted_status(
        class: &GatewayClass,
        ctx: &Context,
        verdict: &ClassVerdict,
    ) -> Result<()> {
        let name = class.name_any();
        let generation = class.metadata.generation;

        let accepted = match verdict {
            ClassVerdict::Accepted => condition(
                "Accepted",
                true,
                "Accepted",
                &format!(
                    "GatewayClass is accepted by controller {}",
                    ctx.config.controller_name
                ),
                generation,
            ),
            ClassVerdict::Rejected(reason) => {
                condition("Accepted", false, "InvalidParameters", reason, generation)
            }
        };

        let desired = [accepted];
        if conditions_current(status_conditions(class.status.as_ref()).as_ref(), &desired) {
            return Ok(());
        }

        let status = json!({ "status": { "conditions": desired } });
        ctx.store.patch_gateway_class_status(&name, &status).await?;

        info!(
            "Updated GatewayClass {} status: accepted={}",
            name,
            *verdict == ClassVerdict::Accepted
        );
        Ok(())
    }

    /// Error handler for controller
    fn error_policy(class: Arc<GatewayClass>, error: &Error, ctx: Arc<Context>) -> Action {
        log_failure("GatewayClass", &class.name_any(), error);
        Action::requeue(ctx.config.timeouts.error_requeue())
    }

    /// Start the GatewayClass controller
    pub async fn run(self) -> Result<()> {
        let api: Api<GatewayClass> = Api::all(self.client.clone());

        info!("Starting GatewayClass controller");

        Controller::new(api, WatcherConfig::default())
            .run(Self::reconcile, Self::error_policy, self.ctx)
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled GatewayClass: {:?}", o),
                    Err(e) => debug!("GatewayClass reconcile pass failed: {}", e),
                }
            })
            .await;

        error!("GatewayClass controller stream ended");
        Ok(())
    }
}
