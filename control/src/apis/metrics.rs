//! Controller metrics
//!
//! Per-loop reconcile counters and latency, plus tunnel and config write
//! activity. Served on `/metrics` by `crate::server`.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// The three reconcile loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLoop {
    GatewayClass,
    Gateway,
    HttpRoute,
}

impl ControlLoop {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlLoop::GatewayClass => "gatewayclass",
            ControlLoop::Gateway => "gateway",
            ControlLoop::HttpRoute => "httproute",
        }
    }
}

lazy_static! {
    /// Controller metrics registry
    pub static ref CONTROLLER_METRICS_REGISTRY: Registry = Registry::new();

    static ref RECONCILIATION_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "tunnelgate_reconciliation_duration_seconds",
            "Reconciliation duration in seconds",
        );
        let histogram = HistogramVec::new(opts, &["controller"])
            .expect("Failed to create histogram");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    static ref RECONCILIATIONS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "tunnelgate_reconciliations_total",
            "Total number of reconciliations by outcome",
        );
        let counter = IntCounterVec::new(opts, &["controller", "result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    static ref TUNNELS_CREATED_TOTAL: IntCounter = {
        let counter = IntCounter::new(
            "tunnelgate_tunnels_created_total",
            "Remote tunnels created",
        )
        .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    static ref CONFIG_WRITES_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "tunnelgate_config_writes_total",
            "Tunnel config write-backs per gateway",
        );
        let counter = IntCounterVec::new(opts, &["namespace", "gateway"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    static ref INGRESS_RULES: IntGaugeVec = {
        let opts = Opts::new(
            "tunnelgate_ingress_rules",
            "Ingress rules in the last written tunnel config",
        );
        let gauge = IntGaugeVec::new(opts, &["namespace", "gateway"])
            .expect("Failed to create gauge");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };
}

/// Record one reconcile pass
pub fn record_reconciliation(controller: ControlLoop, duration_secs: f64, result: &str) {
    RECONCILIATION_DURATION
        .with_label_values(&[controller.as_str()])
        .observe(duration_secs);

    RECONCILIATIONS_TOTAL
        .with_label_values(&[controller.as_str(), result])
        .inc();
}

pub fn record_tunnel_created() {
    TUNNELS_CREATED_TOTAL.inc();
}

/// Record a config write-back and the resulting rule count
pub fn record_config_write(namespace: &str, gateway: &str, rules: usize) {
    CONFIG_WRITES_TOTAL
        .with_label_values(&[namespace, gateway])
        .inc();
    INGRESS_RULES
        .with_label_values(&[namespace, gateway])
        .set(rules as i64);
}

/// Gather controller metrics in the Prometheus text format
pub fn gather_controller_metrics() -> Result<String, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = CONTROLLER_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}
