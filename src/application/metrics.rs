//! Signaling metrics recorded by the relay router

use metrics::{counter, gauge};

/// Update live sessions gauge
pub fn update_active_sessions(count: usize) {
    gauge!("webphone_sessions_active").set(count as f64);
}

/// Record an accepted offer
pub fn record_call_offered() {
    counter!("webphone_calls_offered_total").increment(1);
}

/// Record a call reaching Connected
pub fn record_call_connected() {
    counter!("webphone_calls_connected_total").increment(1);
}

/// Record a call setup failure
pub fn record_call_failed(reason: &'static str) {
    counter!("webphone_calls_failed_total", "reason" => reason).increment(1);
}

/// Record a telephony release
pub fn record_telephony_release() {
    counter!("webphone_telephony_releases_total").increment(1);
}

/// Record a rejected client message
pub fn record_protocol_violation() {
    counter!("webphone_protocol_violations_total").increment(1);
}
