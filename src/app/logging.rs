use tracing_subscriber::EnvFilter;

pub const LOG_FORMAT_ENV: &str = "ADB_FLEET_LOG_FORMAT";

/// Installs the global subscriber. `RUST_LOG` wins over `default_level`; calling this more
/// than once keeps the first subscriber.
pub fn init_logging(default_level: &str) {
    let fallback = if default_level.trim().is_empty() {
        "info"
    } else {
        default_level.trim()
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if use_json_output(std::env::var(LOG_FORMAT_ENV).ok().as_deref()) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_target(false)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_names(true)
            .try_init();
    }
}

fn use_json_output(format: Option<&str>) -> bool {
    match format.map(|value| value.trim().to_lowercase()) {
        Some(value) if value == "json" => true,
        Some(value) if value == "text" || value == "pretty" => false,
        _ => !cfg!(debug_assertions),
    }
}
