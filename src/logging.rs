use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs a stderr subscriber honouring `RUST_LOG`.
pub fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "scrnaseq=debug,info"
    } else {
        "scrnaseq=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .compact(),
        )
        .try_init();
    if installed.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}
