//! Prometheus metrics endpoint
//!
//! Text exposition format over atomics and `parking_lot`; counters, gauges and
//! labelled counter families live in one process-wide registry.

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Integer gauge.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub fn dec(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A counter family partitioned by label values.
#[derive(Debug)]
pub struct CounterVec {
    label_names: Vec<&'static str>,
    entries: RwLock<BTreeMap<Vec<String>, Arc<Counter>>>,
}

impl CounterVec {
    fn new(label_names: &[&'static str]) -> Self {
        Self {
            label_names: label_names.to_vec(),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn inc(&self, label_values: &[&str]) {
        self.with_label_values(label_values).inc();
    }

    pub fn get(&self, label_values: &[&str]) -> u64 {
        let key: Vec<String> = label_values.iter().map(|s| s.to_string()).collect();
        self.entries.read().get(&key).map(|c| c.get()).unwrap_or(0)
    }

    fn with_label_values(&self, label_values: &[&str]) -> Arc<Counter> {
        let key: Vec<String> = label_values.iter().map(|s| s.to_string()).collect();
        if let Some(counter) = self.entries.read().get(&key) {
            return Arc::clone(counter);
        }
        Arc::clone(self.entries.write().entry(key).or_default())
    }
}

#[derive(Debug)]
enum MetricKind {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
    CounterVec(Arc<CounterVec>),
}

impl MetricKind {
    fn type_name(&self) -> &'static str {
        match self {
            MetricKind::Counter(_) | MetricKind::CounterVec(_) => "counter",
            MetricKind::Gauge(_) => "gauge",
        }
    }
}

#[derive(Debug)]
struct Metric {
    name: &'static str,
    help: &'static str,
    kind: MetricKind,
}

/// Ordered collection of registered metrics.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    metrics: RwLock<Vec<Metric>>,
}

/// The global registry rendered by `/metrics`.
pub static METRICS: LazyLock<MetricsRegistry> = LazyLock::new(MetricsRegistry::default);

impl MetricsRegistry {
    pub fn counter(&self, name: &'static str, help: &'static str) -> Arc<Counter> {
        let counter = Arc::new(Counter::default());
        self.push(name, help, MetricKind::Counter(Arc::clone(&counter)));
        counter
    }

    pub fn gauge(&self, name: &'static str, help: &'static str) -> Arc<Gauge> {
        let gauge = Arc::new(Gauge::default());
        self.push(name, help, MetricKind::Gauge(Arc::clone(&gauge)));
        gauge
    }

    pub fn counter_vec(
        &self,
        name: &'static str,
        help: &'static str,
        label_names: &[&'static str],
    ) -> Arc<CounterVec> {
        let family = Arc::new(CounterVec::new(label_names));
        self.push(name, help, MetricKind::CounterVec(Arc::clone(&family)));
        family
    }

    fn push(&self, name: &'static str, help: &'static str, kind: MetricKind) {
        self.metrics.write().push(Metric { name, help, kind });
    }

    /// Render every metric in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let metrics = self.metrics.read();
        let mut out = String::with_capacity(1024);

        for metric in metrics.iter() {
            let _ = writeln!(out, "# HELP {} {}", metric.name, metric.help);
            let _ = writeln!(out, "# TYPE {} {}", metric.name, metric.kind.type_name());

            match &metric.kind {
                MetricKind::Counter(counter) => {
                    let _ = writeln!(out, "{} {}", metric.name, counter.get());
                }
                MetricKind::Gauge(gauge) => {
                    let _ = writeln!(out, "{} {}", metric.name, gauge.get());
                }
                MetricKind::CounterVec(family) => {
                    for (values, counter) in family.entries.read().iter() {
                        let labels = format_labels(&family.label_names, values);
                        let _ = writeln!(out, "{}{} {}", metric.name, labels, counter.get());
                    }
                }
            }
        }

        out
    }
}

fn format_labels(names: &[&str], values: &[String]) -> String {
    let pairs: Vec<String> = names
        .iter()
        .zip(values)
        .map(|(name, value)| format!("{}=\"{}\"", name, escape_label_value(value)))
        .collect();
    format!("{{{}}}", pairs.join(","))
}

fn escape_label_value(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Application metric handles.
pub struct PollMetrics {
    pub polls_started_total: Arc<Counter>,
    pub polls_completed_total: Arc<CounterVec>,
    pub answers_total: Arc<CounterVec>,
    pub ws_connections_active: Arc<Gauge>,
    pub ws_messages_total: Arc<CounterVec>,
    pub participants: Arc<Gauge>,
}

pub static POLL_METRICS: LazyLock<PollMetrics> = LazyLock::new(|| register(&METRICS));

fn register(registry: &MetricsRegistry) -> PollMetrics {
    PollMetrics {
        polls_started_total: registry.counter(
            "pollroom_polls_started_total",
            "Total polls started",
        ),
        polls_completed_total: registry.counter_vec(
            "pollroom_polls_completed_total",
            "Total polls completed, by completion reason",
            &["reason"],
        ),
        answers_total: registry.counter_vec(
            "pollroom_answers_total",
            "Total answer submissions, by outcome",
            &["result"],
        ),
        ws_connections_active: registry.gauge(
            "pollroom_ws_connections_active",
            "Open WebSocket connections",
        ),
        ws_messages_total: registry.counter_vec(
            "pollroom_ws_messages_total",
            "WebSocket requests handled, by method",
            &["method"],
        ),
        participants: registry.gauge("pollroom_participants", "Registered participants"),
    }
}

/// `GET /metrics`
pub async fn metrics_handler() -> impl IntoResponse {
    LazyLock::force(&POLL_METRICS);
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        METRICS.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_inc() {
        let c = Counter::default();
        assert_eq!(c.get(), 0);
        c.inc();
        c.inc();
        assert_eq!(c.get(), 2);
    }

    #[test]
    fn test_gauge_dec_saturates() {
        let g = Gauge::default();
        g.inc();
        g.dec();
        g.dec();
        assert_eq!(g.get(), 0);
        g.set(7);
        assert_eq!(g.get(), 7);
    }

    #[test]
    fn test_render_counter_and_gauge() {
        let reg = MetricsRegistry::default();
        let c = reg.counter("test_started_total", "Started");
        let g = reg.gauge("test_open", "Open");
        c.inc();
        g.set(3);

        let output = reg.render();
        assert!(output.contains("# HELP test_started_total Started"));
        assert!(output.contains("# TYPE test_started_total counter"));
        assert!(output.contains("test_started_total 1"));
        assert!(output.contains("# TYPE test_open gauge"));
        assert!(output.contains("test_open 3"));
    }

    #[test]
    fn test_render_counter_vec() {
        let reg = MetricsRegistry::default();
        let family = reg.counter_vec("test_completed_total", "Completed", &["reason"]);
        family.inc(&["deadline"]);
        family.inc(&["deadline"]);
        family.inc(&["allAnswered"]);

        assert_eq!(family.get(&["deadline"]), 2);
        assert_eq!(family.get(&["recovered"]), 0);
        let output = reg.render();
        assert!(output.contains("test_completed_total{reason=\"deadline\"} 2"));
        assert!(output.contains("test_completed_total{reason=\"allAnswered\"} 1"));
    }

    #[test]
    fn test_format_labels_escapes() {
        let labels = format_labels(&["method", "note"], &["GET".into(), "say \"hi\"".into()]);
        assert_eq!(labels, "{method=\"GET\",note=\"say \\\"hi\\\"\"}");
    }

    #[test]
    fn test_render_empty_registry() {
        assert!(MetricsRegistry::default().render().is_empty());
    }

    #[tokio::test]
    async fn test_metrics_handler_lists_poll_metrics() {
        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4; charset=utf-8"
        );

        let output = METRICS.render();
        assert!(output.contains("pollroom_polls_started_total"));
        assert!(output.contains("pollroom_ws_connections_active"));
        assert!(output.contains("pollroom_participants"));
    }
}
