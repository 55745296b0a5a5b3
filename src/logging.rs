use tracing_subscriber::EnvFilter;

/// Install the stderr subscriber. The level defaults to `info` and can
/// be overridden through the `EXECMUXD_LOG` environment variable.
pub fn init() {
    let filter = EnvFilter::try_from_env("EXECMUXD_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .try_init();
}
