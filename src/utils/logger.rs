//! Logging infrastructure.

/// Initialize the tracing subscriber. Unknown levels fall back to `info`.
pub fn init_logger(log_level: &str) {
    tracing_subscriber::fmt()
        .with_max_level(log_level.parse().unwrap_or(tracing::Level::INFO))
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_target(false)
        .init();
}
