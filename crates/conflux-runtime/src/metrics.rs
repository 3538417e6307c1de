//! Prometheus metrics for aggregation

use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

use crate::policy::CompletionTrigger;

/// Metrics collection for an aggregation coordinator
#[derive(Clone)]
pub struct AggregationMetrics {
    registry: Arc<Registry>,
    pub groups_created: Counter,
    pub groups_completed: CounterVec,
    pub faults_total: CounterVec,
    pub late_messages: Counter,
    pub active_groups: Gauge,
    pub group_size: Histogram,
}

impl AggregationMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let groups_created = Counter::new(
            "conflux_groups_created_total",
            "Aggregation groups created",
        )
        .expect("failed to create groups_created counter");

        let groups_completed = CounterVec::new(
            Opts::new(
                "conflux_groups_completed_total",
                "Aggregation groups finalized, by completion trigger",
            ),
            &["trigger"],
        )
        .expect("failed to create groups_completed counter");

        let faults_total = CounterVec::new(
            Opts::new("conflux_faults_total", "Aggregation faults by kind"),
            &["kind"],
        )
        .expect("failed to create faults_total counter");

        let late_messages = Counter::new(
            "conflux_late_messages_total",
            "Messages that arrived after their group completed",
        )
        .expect("failed to create late_messages counter");

        let active_groups = Gauge::new("conflux_active_groups", "Groups currently collecting")
            .expect("failed to create active_groups gauge");

        let group_size = Histogram::with_opts(
            HistogramOpts::new("conflux_group_size", "Messages per finalized group")
                .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 500.0]),
        )
        .expect("failed to create group_size histogram");

        registry
            .register(Box::new(groups_created.clone()))
            .expect("failed to register groups_created");
        registry
            .register(Box::new(groups_completed.clone()))
            .expect("failed to register groups_completed");
        registry
            .register(Box::new(faults_total.clone()))
            .expect("failed to register faults_total");
        registry
            .register(Box::new(late_messages.clone()))
            .expect("failed to register late_messages");
        registry
            .register(Box::new(active_groups.clone()))
            .expect("failed to register active_groups");
        registry
            .register(Box::new(group_size.clone()))
            .expect("failed to register group_size");

        Self {
            registry: Arc::new(registry),
            groups_created,
            groups_completed,
            faults_total,
            late_messages,
            active_groups,
            group_size,
        }
    }

    pub fn record_created(&self) {
        self.groups_created.inc();
        self.active_groups.inc();
    }

    pub fn record_completed(&self, trigger: CompletionTrigger, size: usize) {
        self.groups_completed
            .with_label_values(&[trigger.as_str()])
            .inc();
        self.active_groups.dec();
        self.group_size.observe(size as f64);
    }

    pub fn record_fault(&self, kind: &str) {
        self.faults_total.with_label_values(&[kind]).inc();
    }

    pub fn record_late(&self) {
        self.late_messages.inc();
    }

    pub fn completed_count(&self, trigger: CompletionTrigger) -> u64 {
        self.groups_completed
            .with_label_values(&[trigger.as_str()])
            .get() as u64
    }

    /// Get Prometheus text output
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for AggregationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
