use crate::prelude::*;
use prometheus::{Encoder, HistogramVec, IntCounterVec, TextEncoder};

const TASKS_METRIC: &str = "grader_completed_tasks_total";
const ENDPOINT_TIME_METRIC: &str = "grader_endpoint_seconds";

#[derive(Clone)]
pub struct Metrics {
    grader_completed_tasks_total: IntCounterVec,
    grader_endpoint_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Fallible<Self> {
        let tasks_opts = prometheus::opts!(TASKS_METRIC, "total completed runner tasks");
        let grader_completed_tasks_total =
            prometheus::register_int_counter_vec!(tasks_opts, &["kind", "outcome"])?;

        let endpoint_opts =
            prometheus::histogram_opts!(ENDPOINT_TIME_METRIC, "endpoint response time");
        let grader_endpoint_seconds =
            prometheus::register_histogram_vec!(endpoint_opts, &["method", "endpoint"])?;

        Ok(Metrics {
            grader_completed_tasks_total,
            grader_endpoint_seconds,
        })
    }

    pub fn record_task(&self, kind: &str, success: bool) {
        let outcome = if success { "success" } else { "error" };
        self.grader_completed_tasks_total
            .with_label_values(&[kind, outcome])
            .inc();
    }

    pub fn record_endpoint_time(&self, method: &str, endpoint: &str, seconds: f64) {
        self.grader_endpoint_seconds
            .with_label_values(&[method, endpoint])
            .observe(seconds);
    }

    pub fn render() -> Fallible<String> {
        let families = prometheus::gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// The default prometheus registry rejects a second registration of the
    /// same collector, so every test shares this instance.
    #[cfg(test)]
    pub(crate) fn shared() -> Metrics {
        use lazy_static::lazy_static;

        lazy_static! {
            static ref METRICS: Metrics = Metrics::new().unwrap();
        }
        METRICS.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::{Metrics, TASKS_METRIC};

    #[test]
    fn test_task_counters_render() {
        let metrics = Metrics::shared();
        metrics.record_task("answer", true);
        metrics.record_task("observation", false);
        metrics.record_endpoint_time("POST", "experiment", 0.03);

        let rendered = Metrics::render().unwrap();
        assert!(rendered.contains(TASKS_METRIC));
        assert!(rendered.contains("kind=\"answer\""));
        assert!(rendered.contains("outcome=\"error\""));
    }
}
