//! Tracing initialisation for the pipeline binaries.

use tracing_subscriber::EnvFilter;

use crate::config::parse_flag;

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `VERBOSE` selects between debug and
/// info. `LOG_ENABLE_TIMESTAMP` and `LOG_ENABLE_COLORED_OUTPUT` control the
/// formatter and default to on. Safe to call more than once; later calls
/// are no-ops.
pub fn init(default_directive: &str) {
    let verbose = env_flag("VERBOSE", false);
    let fallback = if verbose {
        format!("debug,{default_directive}")
    } else {
        format!("info,{default_directive}")
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(env_flag("LOG_ENABLE_COLORED_OUTPUT", true));

    if env_flag("LOG_ENABLE_TIMESTAMP", true) {
        let _ = builder.try_init();
    } else {
        let _ = builder.without_time().try_init();
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|raw| parse_flag(&raw))
        .unwrap_or(default)
}
