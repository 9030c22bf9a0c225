//! Prometheus metrics for the coordinator.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `demo_queue_size` | Gauge | — |
//! | `demo_sessions_active` | Gauge | — |
//! | `demo_sessions_started_total` | Counter | — |
//! | `demo_sessions_ended_total` | Counter | `reason` |
//! | `demo_invites_validated_total` | Counter | `status` |
//! | `demo_session_duration_seconds` | Histogram | `reason` |
//! | `demo_queue_wait_seconds` | Histogram | — |
//! | `demo_ttyd_spawn_seconds` | Histogram | — |
//!
//! All metrics use interior mutability and are safe to share across threads;
//! the struct is `Clone` and every clone updates the same series. Export is
//! text-format via [`GateMetrics::encode_text`], served at `GET /metrics`.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

/// Histogram buckets for session duration in seconds (30s to 2h).
const DURATION_BUCKETS: &[f64] = &[30.0, 120.0, 600.0, 1800.0, 3600.0, 5400.0, 7200.0];

/// Histogram buckets for queue wait in seconds.
const WAIT_BUCKETS: &[f64] = &[1.0, 30.0, 120.0, 600.0, 1800.0, 3600.0];

/// Histogram buckets for ttyd spawn latency in seconds.
const SPAWN_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Registry plus all coordinator metric series.
#[derive(Clone)]
pub struct GateMetrics {
    registry: Registry,
    queue_size: IntGauge,
    sessions_active: IntGauge,
    sessions_started_total: IntCounter,
    sessions_ended_total: IntCounterVec,
    invites_validated_total: IntCounterVec,
    session_duration_seconds: HistogramVec,
    queue_wait_seconds: Histogram,
    ttyd_spawn_seconds: Histogram,
}

impl GateMetrics {
    /// Creates the registry and registers every series with it.
    ///
    /// Panics only on duplicate registration, which cannot happen with a fresh
    /// registry, so construction is infallible in practice.
    pub fn new() -> Self {
        let registry = Registry::new();

        let queue_size = IntGauge::new("demo_queue_size", "Number of clients waiting in the queue")
            .expect("metric opts are valid");
        registry
            .register(Box::new(queue_size.clone()))
            .expect("fresh registry");

        let sessions_active = IntGauge::new(
            "demo_sessions_active",
            "Whether a session currently holds the slot (0 or 1)",
        )
        .expect("metric opts are valid");
        registry
            .register(Box::new(sessions_active.clone()))
            .expect("fresh registry");

        let sessions_started_total = IntCounter::new(
            "demo_sessions_started_total",
            "Total sessions started since process start",
        )
        .expect("metric opts are valid");
        registry
            .register(Box::new(sessions_started_total.clone()))
            .expect("fresh registry");

        let sessions_ended_total = IntCounterVec::new(
            Opts::new("demo_sessions_ended_total", "Total sessions ended"),
            &["reason"],
        )
        .expect("metric opts are valid");
        registry
            .register(Box::new(sessions_ended_total.clone()))
            .expect("fresh registry");

        let invites_validated_total = IntCounterVec::new(
            Opts::new(
                "demo_invites_validated_total",
                "Invite validation decisions",
            ),
            &["status"],
        )
        .expect("metric opts are valid");
        registry
            .register(Box::new(invites_validated_total.clone()))
            .expect("fresh registry");

        let session_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "demo_session_duration_seconds",
                "Wall-clock session duration",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["reason"],
        )
        .expect("metric opts are valid");
        registry
            .register(Box::new(session_duration_seconds.clone()))
            .expect("fresh registry");

        let queue_wait_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "demo_queue_wait_seconds",
                "Time between queue entry and session start",
            )
            .buckets(WAIT_BUCKETS.to_vec()),
        )
        .expect("metric opts are valid");
        registry
            .register(Box::new(queue_wait_seconds.clone()))
            .expect("fresh registry");

        let ttyd_spawn_seconds = Histogram::with_opts(
            HistogramOpts::new("demo_ttyd_spawn_seconds", "ttyd subprocess spawn latency")
                .buckets(SPAWN_BUCKETS.to_vec()),
        )
        .expect("metric opts are valid");
        registry
            .register(Box::new(ttyd_spawn_seconds.clone()))
            .expect("fresh registry");

        Self {
            registry,
            queue_size,
            sessions_active,
            sessions_started_total,
            sessions_ended_total,
            invites_validated_total,
            session_duration_seconds,
            queue_wait_seconds,
            ttyd_spawn_seconds,
        }
    }

    pub fn set_queue_size(&self, size: usize) {
        self.queue_size.set(size as i64);
    }

    pub fn set_session_active(&self, active: bool) {
        self.sessions_active.set(i64::from(active));
    }

    pub fn session_started(&self) {
        self.sessions_started_total.inc();
    }

    pub fn session_ended(&self, reason: &str, duration_secs: f64) {
        self.sessions_ended_total.with_label_values(&[reason]).inc();
        self.session_duration_seconds
            .with_label_values(&[reason])
            .observe(duration_secs);
    }

    pub fn invite_validated(&self, status: &str) {
        self.invites_validated_total
            .with_label_values(&[status])
            .inc();
    }

    pub fn observe_queue_wait(&self, wait_secs: f64) {
        self.queue_wait_seconds.observe(wait_secs);
    }

    pub fn observe_spawn(&self, spawn_secs: f64) {
        self.ttyd_spawn_seconds.observe(spawn_secs);
    }

    /// Encode the registry in Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| format!("Failed to encode metrics: {e}"))?;
        String::from_utf8(buffer).map_err(|e| format!("Metrics output was not UTF-8: {e}"))
    }
}

impl Default for GateMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_encodes_all_series() {
        let metrics = GateMetrics::new();
        metrics.set_queue_size(3);
        metrics.set_session_active(true);
        metrics.session_started();
        metrics.session_ended("timeout", 1800.0);
        metrics.invite_validated("valid");
        metrics.observe_queue_wait(42.0);
        metrics.observe_spawn(0.3);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("demo_queue_size 3"));
        assert!(text.contains("demo_sessions_active 1"));
        assert!(text.contains("demo_sessions_started_total 1"));
        assert!(text.contains(r#"demo_sessions_ended_total{reason="timeout"} 1"#));
        assert!(text.contains(r#"demo_invites_validated_total{status="valid"} 1"#));
        assert!(text.contains("demo_queue_wait_seconds_count 1"));
        assert!(text.contains("demo_ttyd_spawn_seconds_count 1"));
    }

    #[test]
    fn clones_share_series() {
        let metrics = GateMetrics::new();
        let clone = metrics.clone();
        clone.session_started();
        metrics.session_started();
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("demo_sessions_started_total 2"));
    }
}
