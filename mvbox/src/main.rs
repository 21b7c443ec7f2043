use tracing_subscriber::EnvFilter;

fn main() {
    // Debug builds log our crate at debug level, RUST_LOG overrides
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("mvbox_lib=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = mvbox_lib::run() {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}
