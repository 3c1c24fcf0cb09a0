// logging.rs

use tracing_subscriber::EnvFilter;

use crate::error::{IbfError, Result};

/// Install a stderr subscriber. `RUST_LOG` wins when set; otherwise the level
/// is `debug` when verbose and `info` when not.
pub fn init_logging(verbose: bool) -> Result<()> {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .try_init()
        .map_err(|e| IbfError::StringError(format!("failed to install logger: {}", e)))
}
