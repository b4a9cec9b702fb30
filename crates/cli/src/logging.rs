//! Tracing subscriber setup for the CLI.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Resolve the filter directive: `TILLMATCH_LOG`, then `RUST_LOG`, then `info`.
fn filter_directive() -> String {
    std::env::var("TILLMATCH_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_FILTER.to_string())
}

/// Install the global subscriber. Logs always go to stderr so stdout stays
/// clean for JSON reports.
pub fn init(json: bool) {
    let directive = filter_directive();
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        tracing::debug!("global tracing subscriber already installed");
    }
}
