use tracing_subscriber::EnvFilter;

/// Install the global subscriber for one binary.
///
/// `RUST_LOG` drives filtering (default `info`). `ARENA_LOG_FORMAT=json`
/// switches to one JSON object per line.
pub fn init(service: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("ARENA_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let installed = if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    };

    if installed.is_ok() {
        tracing::debug!(service, "Logging initialized");
    }
}
