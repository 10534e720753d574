//! Prometheus metrics for the sync scheduler

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    /// Histogram: cycle duration by trigger (seconds)
    pub static ref CYCLE_DURATION: HistogramVec = register_histogram_vec!(
        "herald_cycle_duration_seconds",
        "Duration of sync cycles",
        &["trigger"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .expect("Failed to create cycle_duration metric");

    /// Counter: cycles by outcome
    pub static ref CYCLES: CounterVec = register_counter_vec!(
        "herald_cycles_total",
        "Total sync cycles by status",
        &["status"]
    )
    .expect("Failed to create cycles metric");

    /// Counter: notifications by classification and result
    pub static ref NOTIFICATIONS: CounterVec = register_counter_vec!(
        "herald_notifications_total",
        "Notifications attempted, by classification and result",
        &["classification", "result"]
    )
    .expect("Failed to create notifications metric");

    /// Counter: per-tenant failures by error kind
    pub static ref TENANT_FAILURES: CounterVec = register_counter_vec!(
        "herald_tenant_failures_total",
        "Per-tenant cycle failures by error kind",
        &["kind"]
    )
    .expect("Failed to create tenant_failures metric");

    /// Gauge: tenants examined in the last cycle
    pub static ref TENANTS_CHECKED: Gauge = register_gauge!(
        "herald_tenants_checked",
        "Tenants polled in the most recent cycle"
    )
    .expect("Failed to create tenants_checked metric");

    /// Gauge: daemon health status (1 = healthy, 0 = unhealthy)
    pub static ref HEALTH_STATUS: Gauge = register_gauge!(
        "herald_health_status",
        "Daemon health status (1 = healthy, 0 = unhealthy)"
    )
    .expect("Failed to create health_status metric");
}

/// Record how long a cycle took
pub fn record_cycle_duration(trigger: &str, duration_secs: f64) {
    CYCLE_DURATION
        .with_label_values(&[trigger])
        .observe(duration_secs);
}

/// Record a completed cycle ("ok", "partial" or "aborted")
pub fn record_cycle(status: &str) {
    CYCLES.with_label_values(&[status]).inc();
}

/// Record one notification attempt
pub fn record_notification(classification: &str, sent: bool) {
    NOTIFICATIONS
        .with_label_values(&[classification, if sent { "sent" } else { "failed" }])
        .inc();
}

/// Record a tenant that failed this cycle
pub fn record_tenant_failure(kind: &str) {
    TENANT_FAILURES.with_label_values(&[kind]).inc();
}

pub fn set_tenants_checked(count: usize) {
    TENANTS_CHECKED.set(count as f64);
}

/// Set health status
pub fn set_health_status(healthy: bool) {
    HEALTH_STATUS.set(if healthy { 1.0 } else { 0.0 });
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> crate::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| crate::HeraldError::Other(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| crate::HeraldError::Other(format!("Metrics are not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        record_cycle_duration("timer", 1.5);
        record_cycle("ok");
        record_notification("new", true);
        record_notification("updated", false);
        record_tenant_failure("transient_source");
        set_tenants_checked(3);
        set_health_status(true);

        let output = encode_metrics().unwrap();
        assert!(output.contains("herald_cycle_duration_seconds"));
        assert!(output.contains("herald_notifications_total"));
    }
}
