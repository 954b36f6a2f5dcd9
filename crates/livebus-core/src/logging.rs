#![forbid(unsafe_code)]

//! Structured logging support.
//!
//! With the `tracing` feature the usual `tracing` macros are re-exported at
//! the crate root. The `tracing-json` feature additionally provides
//! [`init_json`], a one-call subscriber bootstrap for production builds.

#[cfg(feature = "tracing")]
pub use tracing::{
    debug, debug_span, error, error_span, info, info_span, trace, trace_span, warn, warn_span,
};

/// Install a global JSON subscriber filtered by `filter` (env-filter syntax,
/// e.g. `"livebus_runtime=debug,info"`). `RUST_LOG` takes precedence when set.
///
/// Fails if the filter does not parse or a global subscriber is already set.
#[cfg(feature = "tracing-json")]
pub fn init_json(filter: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tracing_subscriber::EnvFilter;

    let filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => EnvFilter::try_new(filter)?,
    };
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(false)
        .try_init()?;
    Ok(())
}
