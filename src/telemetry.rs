use tracing_subscriber::EnvFilter;

use crate::error::{DeployerError, Result};

/// Environment variable controlling the log filter, with `RUST_LOG` as the
/// fallback.
pub const ENV_LOG: &str = "SC_LOG";

pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_env(ENV_LOG)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|err| DeployerError::Other(format!("failed to install subscriber: {err}")))
}
