//! Configuration validation traits and utilities

use crate::error::{ConfigError, ConfigResult};
use std::time::Duration;

/// Trait for validatable configuration
pub trait Validatable {
    /// Validate the configuration
    fn validate(&self) -> ConfigResult<()>;

    /// Get the domain name for error reporting
    fn domain_name(&self) -> &'static str;

    /// Helper to create a domain-specific validation error
    fn validation_error(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::DomainError {
            domain: self.domain_name().to_string(),
            message: message.into(),
        }
    }
}

/// Validate a required string field
pub fn validate_required_string(value: &str, field_name: &str, domain: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} cannot be empty", field_name),
        });
    }
    Ok(())
}

/// Validate a positive number
pub fn validate_positive<T>(value: T, field_name: &str, domain: &str) -> ConfigResult<()>
where
    T: PartialOrd + Default + std::fmt::Display,
{
    if value <= T::default() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} must be greater than 0, got {}", field_name, value),
        });
    }
    Ok(())
}

/// Validate a non-zero duration
pub fn validate_nonzero_duration(value: Duration, field_name: &str, domain: &str) -> ConfigResult<()> {
    if value.is_zero() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} must be greater than 0", field_name),
        });
    }
    Ok(())
}

/// Validate a URL
pub fn validate_url(url: &str, field_name: &str, domain: &str) -> ConfigResult<()> {
    validate_required_string(url, field_name, domain)?;

    url::Url::parse(url).map_err(|e| ConfigError::DomainError {
        domain: domain.to_string(),
        message: format!("{} has invalid URL format: {}", field_name, e),
    })?;

    Ok(())
}

/// Validate an enum choice
pub fn validate_enum_choice<T>(
    value: &str,
    valid_choices: &[T],
    field_name: &str,
    domain: &str,
) -> ConfigResult<()>
where
    T: AsRef<str>,
{
    let valid: Vec<&str> = valid_choices.iter().map(|c| c.as_ref()).collect();

    if !valid.iter().any(|&v| v.eq_ignore_ascii_case(value)) {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!(
                "{} has invalid value '{}'. Valid choices: {}",
                field_name,
                value,
                valid.join(", ")
            ),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_positive() {
        assert!(validate_positive(3u32, "attempts", "session").is_ok());
        let err = validate_positive(0u32, "attempts", "session").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Domain configuration error in session: attempts must be greater than 0, got 0"
        );
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://rpc.example.com", "rpc_endpoint", "hints").is_ok());
        assert!(validate_url("wss://stream.example.com/ws", "data_endpoint", "hints").is_ok());
        assert!(validate_url("not a url", "rpc_endpoint", "hints").is_err());
        assert!(validate_url("  ", "rpc_endpoint", "hints").is_err());
    }

    #[test]
    fn test_validate_enum_choice_ignores_case() {
        let choices = ["SIGTERM", "SIGKILL"];
        assert!(validate_enum_choice("sigkill", &choices, "force_signal", "shutdown").is_ok());
        assert!(validate_enum_choice("SIGHUP", &choices, "force_signal", "shutdown").is_err());
    }

    #[test]
    fn test_validate_nonzero_duration() {
        assert!(validate_nonzero_duration(Duration::from_millis(1), "tick", "watchdog").is_ok());
        assert!(validate_nonzero_duration(Duration::ZERO, "tick", "watchdog").is_err());
    }
}
