use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber for hosts that do not bring their own.
///
/// `RUST_LOG` wins when set; otherwise `debug` selects the default level.
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(debug: bool) -> bool {
    let default_filter = if debug {
        "info,tenancy_database=debug,tenancy_tenant=debug"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init()
        .is_ok()
}
