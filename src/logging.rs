use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Maps `ROLLER_LOG_LEVEL`'s numeric verbosity (glog-style `-v`) onto a
/// `tracing` level and installs the process-wide subscriber. Called once
/// from `main` before any other engine code runs.
pub fn init(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .json()
        .init();
}
