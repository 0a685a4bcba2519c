// Prometheus metrics for the API, exported at GET /metrics.

use arena_common::types::{ExecutionResult, Language};
use arena_common::validation::ValidationError;
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use tracing::warn;

lazy_static! {
    pub static ref SUBMISSIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("arena_submissions_total", "Jobs admitted to the queue"),
        &["language", "mode"]
    )
    .expect("valid metric definition");
    pub static ref REJECTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("arena_validation_rejections_total", "Submissions rejected at admission"),
        &["reason"]
    )
    .expect("valid metric definition");
    pub static ref RESULTS: IntCounterVec = IntCounterVec::new(
        Opts::new("arena_results_total", "Results delivered to callers"),
        &["language", "status"]
    )
    .expect("valid metric definition");
    pub static ref EXECUTION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("arena_execution_duration_seconds", "Reported runtime of delivered results")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["language"]
    )
    .expect("valid metric definition");
    static ref REGISTRY: Registry = {
        let registry = Registry::new();
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(SUBMISSIONS.clone()),
            Box::new(REJECTIONS.clone()),
            Box::new(RESULTS.clone()),
            Box::new(EXECUTION_SECONDS.clone()),
        ];
        for collector in collectors {
            if let Err(e) = registry.register(collector) {
                warn!(error = %e, "Failed to register metric");
            }
        }
        registry
    };
}

pub fn record_submission(language: Language, mode: &str) {
    SUBMISSIONS.with_label_values(&[language.as_str(), mode]).inc();
}

pub fn record_rejection(error: &ValidationError) {
    let reason = match error {
        ValidationError::MissingField(_) => "missing_field",
        ValidationError::UnsupportedLanguage(_) => "unsupported_language",
        ValidationError::CodeTooLarge { .. } => "code_too_large",
        ValidationError::InputTooLarge { .. } => "input_too_large",
        ValidationError::Malformed(_) => "malformed",
    };
    REJECTIONS.with_label_values(&[reason]).inc();
}

pub fn record_result(language: Language, result: &ExecutionResult) {
    RESULTS
        .with_label_values(&[language.as_str(), result.status.as_str()])
        .inc();
    EXECUTION_SECONDS
        .with_label_values(&[language.as_str()])
        .observe(result.runtime_ms as f64 / 1000.0);
}

/// Text exposition of every registered metric.
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
