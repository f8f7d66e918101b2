use std::sync::LazyLock;

use prometheus::*;

static METRIC_SEARCH_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ps_search_count",
        "count of search requests",
        &["descriptors", "nprobe"]
    )
    .unwrap()
});

static METRIC_SEARCH_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "ps_search_duration",
        "duration of the per-request search in seconds",
        &["descriptors", "nprobe"]
    )
    .unwrap()
});

static METRIC_SEARCH_MAX_SCORE: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "ps_search_max_score",
        "max score of the per-request search",
        &["descriptors", "nprobe"],
        (5..=100).step_by(5).map(|x| x as f64).collect()
    )
    .unwrap()
});

pub fn inc_search_count(descriptors: usize, nprobe: usize) {
    let descriptors = to_fixed_count(descriptors);
    METRIC_SEARCH_COUNT.with_label_values(&[descriptors, &nprobe.to_string()]).inc();
}

pub fn observe_search_duration(descriptors: usize, nprobe: usize, duration: f32) {
    let descriptors = to_fixed_count(descriptors);
    METRIC_SEARCH_DURATION
        .with_label_values(&[descriptors, &nprobe.to_string()])
        .observe(duration as f64);
}

pub fn observe_search_max_score(descriptors: usize, nprobe: usize, score: f32) {
    let descriptors = to_fixed_count(descriptors);
    METRIC_SEARCH_MAX_SCORE
        .with_label_values(&[descriptors, &nprobe.to_string()])
        .observe(score as f64);
}

/// 把查询描述子数量归到几个固定档位，避免标签基数爆炸
fn to_fixed_count(n: usize) -> &'static str {
    if n <= 64 {
        "64"
    } else if n <= 128 {
        "128"
    } else if n <= 256 {
        "256"
    } else if n <= 512 {
        "512"
    } else {
        "512+"
    }
}
