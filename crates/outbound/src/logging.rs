//! Opt-in `tracing-subscriber` initializer for embedders and integration
//! tests. The core itself never initializes a subscriber — only `tracing`
//! calls, never `println!`/`eprintln!`.

use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable consulted for the filter directive, falling back to
/// `default_filter` when unset or invalid.
pub fn init(env_var: &str, default_filter: &str) {
    let filter = EnvFilter::try_new(std::env::var(env_var).as_deref().unwrap_or(default_filter))
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
