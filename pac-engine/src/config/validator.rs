//! Configuration validation

use super::schema::Config;
use crate::error::{Result, ValidationError};
use std::net::SocketAddr;

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate entire configuration
    pub fn validate(config: &Config) -> Result<()> {
        Self::validate_listen(&config.server.listen)?;
        Self::validate_source(&config.pac.source)?;
        Self::validate_nonzero(config)?;
        Ok(())
    }

    fn validate_listen(listen: &str) -> Result<()> {
        listen
            .parse::<SocketAddr>()
            .map(|_| ())
            .map_err(|_| {
                ValidationError::InvalidListen {
                    address: listen.to_string(),
                }
                .into()
            })
    }

    fn validate_source(source: &str) -> Result<()> {
        if source.trim().is_empty() {
            return Err(ValidationError::InvalidSource {
                source_ref: source.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Reject zero durations and limits
    fn validate_nonzero(config: &Config) -> Result<()> {
        let fields: [(&'static str, u64); 5] = [
            ("health.dial_timeout_ms", config.health.dial_timeout_ms),
            ("health.idle_timeout_ms", config.health.idle_timeout_ms),
            ("health.blacklist_ms", config.health.blacklist_ms),
            (
                "sandbox.loop_iteration_limit",
                config.sandbox.loop_iteration_limit,
            ),
            (
                "sandbox.recursion_limit",
                config.sandbox.recursion_limit as u64,
            ),
        ];

        for (field, value) in fields {
            if value == 0 {
                return Err(ValidationError::ZeroValue { field }.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PacError;

    #[test]
    fn test_default_is_valid() {
        assert!(ConfigValidator::validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_invalid_listen() {
        let mut config = Config::default();
        config.server.listen = "localhost".to_string();

        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(matches!(
            err,
            PacError::Validation(ValidationError::InvalidListen { .. })
        ));
    }

    #[test]
    fn test_zero_values() {
        let mut config = Config::default();
        config.health.blacklist_ms = 0;

        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("health.blacklist_ms"));

        let mut config = Config::default();
        config.sandbox.recursion_limit = 0;
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_empty_source() {
        let mut config = Config::default();
        config.pac.source = "  ".to_string();
        assert!(ConfigValidator::validate(&config).is_err());
    }
}
