//! Prometheus metrics recorder and metric-name constants.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint. If a recorder
/// is already installed (second `Services` in one process, e.g. tests), a
/// non-global recorder handle is returned instead so rendering still works.
pub fn install_recorder() -> PrometheusHandle {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("prometheus metrics recorder installed");
            handle
        }
        Err(_) => PrometheusBuilder::new().build_recorder().handle(),
    }
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter, labels: kind).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter, labels: kind).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active registered connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Outbound events dropped on full per-connection queues (counter).
pub const WS_QUEUE_DROPS_TOTAL: &str = "ws_queue_drops_total";
/// Connections reaped by the heartbeat (counter).
pub const WS_HEARTBEAT_REAPS_TOTAL: &str = "ws_heartbeat_reaps_total";
/// Relay frames processed (counter, labels: direction).
pub const RELAY_FRAMES_TOTAL: &str = "relay_frames_total";
/// Malformed worker lines dropped (counter).
pub const RELAY_BAD_FRAMES_TOTAL: &str = "relay_bad_frames_total";
/// Active sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "sessions_active";
/// Session terminal transitions (counter, labels: status).
pub const SESSIONS_TERMINAL_TOTAL: &str = "sessions_terminal_total";
/// Questions currently pending (gauge).
pub const QUESTIONS_PENDING: &str = "questions_pending";
/// Question answers accepted (counter).
pub const QUESTIONS_ANSWERED_TOTAL: &str = "questions_answered_total";
/// API requests rejected by the rate limiter (counter).
pub const AUTH_RATE_LIMITED_TOTAL: &str = "auth_rate_limited_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_twice_is_tolerated() {
        let first = install_recorder();
        let second = install_recorder();
        // Both handles render valid (possibly empty) Prometheus text.
        let _ = first.render();
        let _ = second.render();
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_QUEUE_DROPS_TOTAL,
            WS_HEARTBEAT_REAPS_TOTAL,
            RELAY_FRAMES_TOTAL,
            RELAY_BAD_FRAMES_TOTAL,
            SESSIONS_ACTIVE,
            SESSIONS_TERMINAL_TOTAL,
            QUESTIONS_PENDING,
            QUESTIONS_ANSWERED_TOTAL,
            AUTH_RATE_LIMITED_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
