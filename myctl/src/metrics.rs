use prometheus::{IntCounterVec, Opts, Registry};

/// Coordinator counters, registered on the default registry and served from
/// `GET /metrics`.
pub struct CtlMetrics {
    pub reconciles: IntCounterVec,
    pub reports: IntCounterVec,
}

impl CtlMetrics {
    pub fn new() -> Self {
        let metrics = Self {
            reconciles: counter(
                "myctl_reconcile_total",
                "Total reconciles per cluster",
                &["namespace", "name"],
            ),
            reports: counter(
                "myctl_report_total",
                "Agent reports ingested per cluster",
                &["namespace", "name"],
            ),
        };
        metrics.register(prometheus::default_registry());
        metrics
    }

    fn register(&self, registry: &Registry) {
        for c in [&self.reconciles, &self.reports] {
            // Duplicate registration only happens in tests constructing
            // several coordinators in one process.
            let _ = registry.register(Box::new(c.clone()));
        }
    }

    /// Text exposition of the default registry.
    pub fn gather() -> String {
        use prometheus::Encoder;
        let mut buf = Vec::new();
        let encoder = prometheus::TextEncoder::new();
        if let Err(e) = encoder.encode(&prometheus::default_registry().gather(), &mut buf) {
            tracing::error!(error = %e, "encode metrics");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for CtlMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("well-formed counter opts")
}
