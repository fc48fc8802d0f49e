use super::GLOBAL_LABELS;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

/// Histogram buckets to measure the distribution of request durations in seconds
pub(crate) const DEFAULT_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Processing of a single file spans minutes, because we wait for the
/// companion app to upload it.
pub(crate) const LONG_DURATION_BUCKETS: &[f64] = &[
    5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 900.0, 1200.0, 1800.0,
];

pub fn init_metrics() {
    let mut builder = PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], 2000))
        .set_buckets(DEFAULT_DURATION_BUCKETS)
        .and_then(|builder| {
            builder.set_buckets_for_metric(
                Matcher::Full("file_processing_duration_seconds".to_owned()),
                LONG_DURATION_BUCKETS,
            )
        })
        .expect("BUG: histogram buckets must not be empty");

    for (key, value) in GLOBAL_LABELS {
        builder = builder.add_global_label(*key, *value);
    }

    builder
        .install()
        .expect("BUG: failed to initialize the metrics listener");
}
