use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    fetch_requests: CounterVec,
    fetch_rows: CounterVec,
    fetch_request_seconds: HistogramVec,
    fetch_contexts_open: GaugeVec,
    fetch_contexts_closed: CounterVec,
    requests_rejected: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// `kind` is `resolve` or `close`.
    pub fn record_fetch_request(&self, node: &str, kind: &str, secs: f64) {
        self.inner
            .fetch_requests
            .with_label_values(&[node, kind])
            .inc();
        self.inner
            .fetch_request_seconds
            .with_label_values(&[node])
            .observe(secs.max(0.0));
    }

    pub fn record_fetch_rows(&self, node: &str, table: &str, rows: u64) {
        self.inner
            .fetch_rows
            .with_label_values(&[node, table])
            .inc_by(rows as f64);
    }

    pub fn inc_fetch_contexts_open(&self, node: &str) {
        self.inner
            .fetch_contexts_open
            .with_label_values(&[node])
            .inc();
    }

    pub fn record_fetch_context_closed(&self, node: &str) {
        self.inner
            .fetch_contexts_open
            .with_label_values(&[node])
            .dec();
        self.inner
            .fetch_contexts_closed
            .with_label_values(&[node])
            .inc();
    }

    pub fn inc_requests_rejected(&self, node: &str, action: &str) {
        self.inner
            .requests_rejected
            .with_label_values(&[node, action])
            .inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let fetch_requests = counter_vec(
            &registry,
            "dfq_fetch_requests_total",
            "Node fetch requests handled",
            &["node", "kind"],
        );
        let fetch_rows = counter_vec(
            &registry,
            "dfq_fetch_rows_total",
            "Rows materialized by node fetch requests",
            &["node", "table"],
        );
        let fetch_request_seconds = histogram_vec(
            &registry,
            "dfq_fetch_request_seconds",
            "Time spent handling node fetch requests",
            &["node"],
        );
        let fetch_contexts_open = gauge_vec(
            &registry,
            "dfq_fetch_contexts_open",
            "Currently open job fetch contexts",
            &["node"],
        );
        let fetch_contexts_closed = counter_vec(
            &registry,
            "dfq_fetch_contexts_closed_total",
            "Job fetch contexts released",
            &["node"],
        );
        let requests_rejected = counter_vec(
            &registry,
            "dfq_requests_rejected_total",
            "Sheddable node requests rejected for lack of executor slots",
            &["node", "action"],
        );

        Self {
            registry,
            fetch_requests,
            fetch_rows,
            fetch_request_seconds,
            fetch_contexts_open,
            fetch_contexts_closed,
            requests_rejected,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.record_fetch_request("n1", "resolve", 0.01);
        m.record_fetch_rows("n1", "doc.t1", 3);
        m.inc_fetch_contexts_open("n1");
        m.record_fetch_context_closed("n1");
        m.inc_requests_rejected("n1", "delete_partition");
        let text = m.render_prometheus();

        assert!(text.contains("dfq_fetch_requests_total"));
        assert!(text.contains("dfq_fetch_rows_total"));
        assert!(text.contains("dfq_fetch_request_seconds"));
        assert!(text.contains("dfq_fetch_contexts_open"));
        assert!(text.contains("dfq_fetch_contexts_closed_total"));
        assert!(text.contains("dfq_requests_rejected_total"));
        assert!(text.contains("doc.t1"));
    }
}
