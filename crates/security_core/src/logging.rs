//! Tracing subscriber setup

use crate::config::LoggingConfig;
use crate::error::{SecurityError, SecurityResult};

/// Tracing target for the security event mirror written by the audit consumer
pub const SECURITY_AUDIT_TARGET: &str = "security_audit";

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this more
/// than once is harmless; only the first call installs a subscriber.
///
/// # Errors
///
/// Returns `Configuration` if neither `RUST_LOG` nor the configured level is a
/// valid filter directive.
pub fn init_tracing(config: &LoggingConfig) -> SecurityResult<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.level))
        .map_err(|e| SecurityError::Configuration {
            field: "logging.level".to_string(),
            reason: e.to_string(),
        })?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() -> SecurityResult<()> {
        let config = LoggingConfig::default();
        init_tracing(&config)?;
        init_tracing(&config)?;
        Ok(())
    }
}
