//! Prometheus metrics exposition
//!
//! Metrics emitted by the library crates:
//!
//! - `generation_requests_total` (counter): labels `kind`, `outcome`
//! - `generation_duration_seconds` (histogram): label `kind`
//! - `credential_bans_total` (counter): label `reason`
//!
//! and by the gateway itself:
//!
//! - `pool_credentials` (gauge): label `status`, refreshed on every scrape

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("generation_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Generation durations span a quick image call to a video polled for
/// many minutes, so the histogram buckets run from 1s to 30min.
pub fn install_recorder() -> PrometheusHandle {
    let handle = builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    describe();
    handle
}

fn describe() {
    metrics::describe_counter!(
        "generation_requests_total",
        "Generation runs by media kind and outcome"
    );
    metrics::describe_histogram!(
        "generation_duration_seconds",
        metrics::Unit::Seconds,
        "Wall time of a generation run"
    );
    metrics::describe_counter!(
        "credential_bans_total",
        "Credentials taken out of rotation, by reason"
    );
    metrics::describe_gauge!("pool_credentials", "Credentials by health status");
}

/// Publish pool counts from a `CredentialPool::health()` document.
pub fn record_pool_health(health: &serde_json::Value) {
    for (status, field) in [
        ("available", "credentials_available"),
        ("rate_limited", "credentials_rate_limited"),
        ("disabled", "credentials_disabled"),
    ] {
        let count = health[field].as_u64().unwrap_or(0);
        metrics::gauge!("pool_credentials", "status" => status).set(count as f64);
    }
}
