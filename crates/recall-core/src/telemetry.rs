//! Tracing subscriber setup for host binaries and tests.

use crate::error::{Error, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Directive applied on top of `RUST_LOG`.
pub const DEFAULT_DIRECTIVE: &str = "recall_core=info";

/// Install a global subscriber writing human-readable or JSON lines.
///
/// A second call is a no-op, so every binary and test may call it.
pub fn init_tracing(json: bool) -> Result<()> {
    let directive = DEFAULT_DIRECTIVE
        .parse()
        .map_err(|e| Error::Other(format!("invalid log directive: {e}")))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .try_init();
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        assert!(init_tracing(false).is_ok());
        assert!(init_tracing(true).is_ok());
    }
}
