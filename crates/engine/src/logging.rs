use tracing_subscriber::EnvFilter;

use crate::error::SyncError;

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_DIRECTIVE: &str = "info,nimbus=debug";

/// Installs the global `fmt` subscriber filtered by `RUST_LOG`.
///
/// Falls back to `default_directive`, or [`DEFAULT_DIRECTIVE`] when `None`.
/// Fails if a global subscriber is already set.
pub fn init(default_directive: Option<&str>) -> Result<(), SyncError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive.unwrap_or(DEFAULT_DIRECTIVE)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| SyncError::Config(format!("logging: {e}")))
}
