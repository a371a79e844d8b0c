#[macro_export]
macro_rules! sign_result_metrics {
    ($chain_id:expr, $outcome:expr) => {{
        metrics::counter!("sign_requests_total", "chain_id" => $chain_id.to_string(), "outcome" => $outcome.to_string()).increment(1);
    }};
}

#[macro_export]
macro_rules! sign_latency_metrics {
    ($chain_id:expr, $start:expr) => {{
        metrics::histogram!("sign_duration_seconds", "chain_id" => $chain_id.to_string())
            .record($start.elapsed().as_secs_f64());
    }};
}

#[macro_export]
macro_rules! nonce_cache_metrics {
    ($event:expr) => {{
        metrics::counter!("nonce_cache_events_total", "event" => $event.to_string()).increment(1);
    }};
}
