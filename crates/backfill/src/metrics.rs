//! Prometheus metrics for the backfill pipeline.

use std::sync::LazyLock;

use prometheus::{
    register_histogram_vec,
    register_int_counter_vec,
    register_int_gauge,
    HistogramVec,
    IntCounter,
    IntCounterVec,
    IntGauge,
};

use crate::task::BackfillKind;

static BACKFILL_ROWS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "backfill_rows_total",
        "Rows written by backfill workers",
        &["kind", "table"]
    )
    .expect("register backfill_rows_total")
});

static BACKFILL_BATCH_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "backfill_batch_seconds",
        "Latency of one dispatch round of backfill tasks",
        &["result"]
    )
    .expect("register backfill_batch_seconds")
});

static BACKFILL_WORKER_COUNT: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("backfill_worker_count", "Live backfill workers")
        .expect("register backfill_worker_count")
});

pub fn backfill_rows_counter(kind: BackfillKind, table: &str) -> IntCounter {
    let kind_label = kind.to_string();
    BACKFILL_ROWS_TOTAL.with_label_values(&[kind_label.as_str(), table])
}

pub fn observe_batch_seconds(ok: bool, seconds: f64) {
    let result = if ok { "ok" } else { "error" };
    BACKFILL_BATCH_SECONDS
        .with_label_values(&[result])
        .observe(seconds);
}

pub fn set_worker_count(n: usize) {
    BACKFILL_WORKER_COUNT.set(n as i64);
}
