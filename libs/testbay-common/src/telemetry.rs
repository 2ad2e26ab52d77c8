// Tracing subscriber setup shared by all binaries

use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `RUST_LOG` selects the filter (default `info`), `LOG_FORMAT=json` switches
/// to one JSON object per line for log shipping.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_line_number(true)
            .init();
    }
}
