//! Tracing setup for binaries built on the crate

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global fmt subscriber filtered by `RUST_LOG`.
///
/// `verbose` forces debug output for this crate. Calling it twice is harmless;
/// the second installation is ignored.
pub fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("ganglion=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ganglion=info,warn"))
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
