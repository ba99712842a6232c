use anyhow::{Context as _, Result};
use control::apis::gateway::gateway::GatewayReconciler;
use control::apis::gateway::gateway_class::GatewayClassReconciler;
use control::apis::gateway::http_route::HTTPRouteReconciler;
use control::config::ControllerConfig;
use control::context::Context;
use control::provider::CloudflareProviders;
use control::server::MetricsServer;
use control::store::KubeStore;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// tunnelgate controller
///
/// Runs the GatewayClass, Gateway and HTTPRoute reconcilers plus the
/// metrics endpoint until interrupted.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (needed for Kubernetes and provider TLS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok(); // Ignore error if already installed

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ControllerConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    info!("tunnelgate controller starting");
    info!("   controllerName: {}", config.controller_name);
    info!("   provider API: {}", config.provider_api_url);
    info!("   connector image: {}", config.connector_image);

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let timeout = config.timeouts.request_timeout();
    let store = Arc::new(KubeStore::new(client.clone(), timeout));
    let providers = Arc::new(
        CloudflareProviders::new(&config.provider_api_url, timeout)
            .context("Failed to build provider client")?,
    );
    let metrics_server = MetricsServer::bind(&config.metrics_bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    let ctx = Arc::new(Context::new(store, providers, config));

    let mut handles = vec![tokio::spawn(metrics_server.serve())];

    let gc_reconciler = GatewayClassReconciler::new(client.clone(), ctx.clone());
    handles.push(tokio::spawn(async move {
        if let Err(e) = gc_reconciler.run().await {
            error!("GatewayClass controller error: {}", e);
        }
    }));

    let gw_reconciler = GatewayReconciler::new(client.clone(), ctx.clone());
    handles.push(tokio::spawn(async move {
        if let Err(e) = gw_reconciler.run().await {
            error!("Gateway controller error: {}", e);
        }
    }));

    let hr_reconciler = HTTPRouteReconciler::new(client, ctx);
    handles.push(tokio::spawn(async move {
        if let Err(e) = hr_reconciler.run().await {
            error!("HTTPRoute controller error: {}", e);
        }
    }));

    info!("Gateway API controllers started");

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    // Dropping in-flight reconciles cancels their remote calls
    for handle in handles {
        handle.abort();
    }

    Ok(())
}
