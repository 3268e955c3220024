use std::env;
use tracing_subscriber::EnvFilter;

/// Installs the process-wide tracing subscriber.
///
/// Containers get JSON lines on stdout for the log pipeline; local runs get
/// the human-readable formatter. `RUST_LOG` overrides the default filter.
pub fn init_tracing(default_filter: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let in_container =
        env::var("CONTAINER").is_ok() || std::path::Path::new("/.dockerenv").exists();

    if in_container {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_current_span(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }
}
