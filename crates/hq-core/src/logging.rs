//! Tracing bootstrap for the server binary.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// Filter comes from `RUST_LOG` (default `info`). With `json = true`,
/// emits one JSON object per line for log shippers; otherwise a compact
/// human format.
///
/// Calling twice is a no-op: the second install attempt is ignored so test
/// harnesses can call this freely.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
