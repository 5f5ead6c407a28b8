use tracing_subscriber::{EnvFilter, fmt};

/// Initialise the global tracing subscriber.
///
/// Respects `RUST_LOG` (default `info,sqlx=warn`). Set `LOG_FORMAT=json`
/// for one JSON object per line.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        fmt().with_env_filter(filter).with_target(true).json().init();
    } else {
        fmt().with_env_filter(filter).with_target(true).init();
    }
}
