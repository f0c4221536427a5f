//! Control-plane metrics.
//!
//! Labelled counters and plain gauges on `DashMap` + atomics, rendered in the
//! Prometheus text exposition format. Label sets are sorted so the same
//! labels always hit the same series.

use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn series_key(labels: &[(&str, &str)]) -> Vec<(String, String)> {
    let mut key: Vec<(String, String)> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    key.sort();
    key
}

#[derive(Default)]
pub struct CounterVec {
    map: DashMap<Vec<(String, String)>, AtomicU64>,
}

impl CounterVec {
    pub fn inc(&self, labels: &[(&str, &str)]) {
        self.map
            .entry(series_key(labels))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of one series (0 if never touched).
    pub fn get(&self, labels: &[(&str, &str)]) -> u64 {
        self.map
            .get(&series_key(labels))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum over every series.
    pub fn total(&self) -> u64 {
        self.map.iter().map(|c| c.value().load(Ordering::Relaxed)).sum()
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {name} counter");
        for r in self.map.iter() {
            let labels = r
                .key()
                .iter()
                .map(|(k, v)| format!("{k}=\"{}\"", escape_label(v)))
                .collect::<Vec<_>>()
                .join(",");
            let _ = writeln!(out, "{name}{{{labels}}} {}", r.value().load(Ordering::Relaxed));
        }
    }
}

#[derive(Default)]
pub struct Gauge {
    v: AtomicI64,
}

impl Gauge {
    pub fn inc(&self) {
        self.v.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.v.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.v.load(Ordering::Relaxed)
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {name} gauge\n{name} {}", self.get());
    }
}

#[derive(Default)]
pub struct PlaneMetrics {
    pub machines_active: Gauge,
    pub handshake_rejections: CounterVec,
    pub calls_routed: CounterVec,
    pub routing_failures: CounterVec,
    pub transport_failures: CounterVec,
    pub results_delivered: CounterVec,
    pub late_results: CounterVec,
    pub cancellations: CounterVec,
}

impl PlaneMetrics {
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.machines_active.render("rpcmesh_machines_active", &mut out);
        self.handshake_rejections.render("rpcmesh_handshake_rejections_total", &mut out);
        self.calls_routed.render("rpcmesh_calls_routed_total", &mut out);
        self.routing_failures.render("rpcmesh_routing_failures_total", &mut out);
        self.transport_failures.render("rpcmesh_transport_failures_total", &mut out);
        self.results_delivered.render("rpcmesh_results_delivered_total", &mut out);
        self.late_results.render("rpcmesh_late_results_total", &mut out);
        self.cancellations.render("rpcmesh_cancellations_total", &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_order_does_not_split_series() {
        let c = CounterVec::default();
        c.inc(&[("service", "echo"), ("function", "echo")]);
        c.inc(&[("function", "echo"), ("service", "echo")]);
        assert_eq!(c.get(&[("service", "echo"), ("function", "echo")]), 2);
        assert_eq!(c.total(), 2);
    }

    #[test]
    fn render_escapes_labels() {
        let m = PlaneMetrics::default();
        m.routing_failures.inc(&[("service", "a\"b")]);
        m.machines_active.inc();
        let text = m.render();
        assert!(text.contains("rpcmesh_routing_failures_total{service=\"a\\\"b\"} 1"));
        assert!(text.contains("rpcmesh_machines_active 1"));
    }
}
