use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs the global subscriber. Filter comes from `RUST_LOG`, defaulting
/// to `info`. Logs go to stderr so command output on stdout stays parseable.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .compact();

    let filter_layer = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
