#![forbid(unsafe_code)]

// Metrics module - atomic counters and a Prometheus text endpoint

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Histogram buckets for message handling latency, as (bound in µs, `le`
/// label). Handling is a lock acquisition plus channel fan-out, so the
/// resolution is concentrated below 100ms.
const LATENCY_BUCKETS: [(u64, &str); 10] = [
    (500, "0.0005"),
    (1_000, "0.001"),
    (2_500, "0.0025"),
    (5_000, "0.005"),
    (10_000, "0.01"),
    (25_000, "0.025"),
    (50_000, "0.05"),
    (100_000, "0.1"),
    (500_000, "0.5"),
    (1_000_000, "1"),
];

/// Fixed-bucket histogram. Buckets are stored cumulatively (an observation
/// increments every bucket whose bound covers it), matching the Prometheus
/// exposition so render is a plain load per line.
pub struct Histogram {
    buckets: [AtomicU64; LATENCY_BUCKETS.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (bucket, (bound, _)) in self.buckets.iter().zip(LATENCY_BUCKETS) {
            if us <= bound {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (bucket, (_, label)) in self.buckets.iter().zip(LATENCY_BUCKETS) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", bucket.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Process-wide counters, updated lock-free from every connection task.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    // Monotonic counters
    connections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    errors_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
    signals_relayed_total: AtomicU64,
    admin_actions_total: AtomicU64,
    identities_assigned_total: AtomicU64,

    // Gauge
    connections_active: AtomicU64,

    // Histogram
    message_handling: Histogram,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                messages_received_total: AtomicU64::new(0),
                messages_sent_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                joins_total: AtomicU64::new(0),
                leaves_total: AtomicU64::new(0),
                signals_relayed_total: AtomicU64::new(0),
                admin_actions_total: AtomicU64::new(0),
                identities_assigned_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                message_handling: Histogram::new(),
            }),
        }
    }

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.inner.messages_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.inner.leaves_total.fetch_add(1, Relaxed);
    }

    pub fn inc_signals_relayed(&self) {
        self.inner.signals_relayed_total.fetch_add(1, Relaxed);
    }

    pub fn inc_admin_actions(&self) {
        self.inner.admin_actions_total.fetch_add(1, Relaxed);
    }

    pub fn inc_identities_assigned(&self) {
        self.inner.identities_assigned_total.fetch_add(1, Relaxed);
    }

    /// Increments `connections_active` and returns a guard that decrements
    /// on drop, so the gauge cannot drift when a handler panics.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    /// Render everything in Prometheus text exposition format.
    /// `rooms_active` and `participants_active` come from the registry;
    /// they are read on demand rather than tracked here.
    pub fn render_prometheus(&self, rooms_active: usize, participants_active: usize) -> String {
        let mut out = String::with_capacity(4096);

        let i = &self.inner;

        render_scalar(&mut out, "squawk_connections_total", "counter", "Total WebSocket connections", i.connections_total.load(Relaxed));
        render_scalar(&mut out, "squawk_messages_received_total", "counter", "Total messages received from clients", i.messages_received_total.load(Relaxed));
        render_scalar(&mut out, "squawk_messages_sent_total", "counter", "Total messages sent to clients", i.messages_sent_total.load(Relaxed));
        render_scalar(&mut out, "squawk_errors_total", "counter", "Total errors", i.errors_total.load(Relaxed));
        render_scalar(&mut out, "squawk_joins_total", "counter", "Total room joins", i.joins_total.load(Relaxed));
        render_scalar(&mut out, "squawk_leaves_total", "counter", "Total room leaves", i.leaves_total.load(Relaxed));
        render_scalar(&mut out, "squawk_signals_relayed_total", "counter", "Total WebRTC signals relayed between peers", i.signals_relayed_total.load(Relaxed));
        render_scalar(&mut out, "squawk_admin_actions_total", "counter", "Total admin mute/remove/monitor actions", i.admin_actions_total.load(Relaxed));
        render_scalar(&mut out, "squawk_identities_assigned_total", "counter", "Total meeting ID assignments", i.identities_assigned_total.load(Relaxed));

        render_scalar(&mut out, "squawk_connections_active", "gauge", "Currently active WebSocket connections", i.connections_active.load(Relaxed));
        render_scalar(&mut out, "squawk_rooms_active", "gauge", "Currently active rooms", rooms_active as u64);
        render_scalar(&mut out, "squawk_participants_active", "gauge", "Currently active participants", participants_active as u64);

        i.message_handling.render(
            "squawk_message_handling_seconds",
            "Latency from message receipt to relay completion, in seconds",
            &mut out,
        );

        out
    }
}

/// Decrements `connections_active` when dropped.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_scalar(out: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}
