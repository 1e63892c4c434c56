/// Tracing setup for binaries and tests embedding the engine

/// Install the fmt subscriber; level comes from RUST_LOG (default "nodeward=info")
///
/// Safe to call more than once: later calls leave the first subscriber in place.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nodeward=info"));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!("📡 Tracing initialized");
    }
}
