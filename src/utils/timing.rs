use std::time::Instant;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::info;

use crate::utils::logging::{GENERATION_TARGET, TIMING_TARGET};

pub async fn log_llm_timing<T, E, F, Fut>(
    provider: &str,
    model: &str,
    operation: &str,
    metadata: Option<JsonValue>,
    call: F,
) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let started_at = Utc::now();
    let started_perf = Instant::now();
    let metadata_text = metadata
        .as_ref()
        .map(|value| value.to_string())
        .unwrap_or_else(|| "{}".to_string());
    info!(
        target: TIMING_TARGET,
        "event=llm_request provider={} model={} operation={} started_at={} metadata={}",
        provider,
        model,
        operation,
        started_at.to_rfc3339(),
        metadata_text
    );

    let result = call().await;
    let status = if result.is_ok() { "success" } else { "error" };

    let completed_at = Utc::now();
    let duration = started_perf.elapsed().as_secs_f64();
    info!(
        target: TIMING_TARGET,
        "event=llm_response provider={} model={} operation={} completed_at={} duration_s={:.3} status={} metadata={}",
        provider,
        model,
        operation,
        completed_at.to_rfc3339(),
        duration,
        status,
        metadata_text
    );

    result
}

/// One line per generation attempt, from prompt submission to its final outcome.
pub fn log_generation_outcome(user_id: i64, model: &str, outcome: &str, started: Instant) {
    info!(
        target: GENERATION_TARGET,
        user_id,
        model,
        outcome,
        duration_s = started.elapsed().as_secs_f64(),
        "event=generation_completed"
    );
}
