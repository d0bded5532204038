use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Stdout carries the IPC protocol, so every
/// log line goes to stderr.
pub fn init(directives: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(directives)
        .map_err(|e| anyhow::anyhow!("invalid log filter '{directives}': {e}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}
