use tracing::trace;

// Trace-level counters emitted as structured log events.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "designgenius.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "designgenius.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn credits_changed(user_id: &str, delta: i64, reason: &'static str) {
    trace!(
        target = "designgenius.metrics",
        user_id = user_id,
        delta = delta,
        reason = reason,
        "credits_changed"
    );
}

pub fn poll_attempt(prediction_id: &str, attempt: u32) {
    trace!(
        target = "designgenius.metrics",
        prediction_id = prediction_id,
        attempt = attempt,
        "generation_poll"
    );
}
