// pixelguard-config/src/validation.rs
//! Custom validation functions for configuration.
//!
//! Provides shared validation logic used across multiple configuration modules.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use validator::ValidationError;

use crate::monitor::SourceConfig;

static SOURCE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new("^[A-Za-z0-9_.-]{1,64}$").expect("source name pattern is a valid regex")
});

/// Validate that a given value is a power of two.
pub fn validate_power_of_two(value: usize) -> Result<(), ValidationError> {
    if value.is_power_of_two() {
        Ok(())
    } else {
        Err(ValidationError::new("must_be_power_of_two"))
    }
}

/// Validate that a rate or ratio lies in `[0, 1]`.
pub fn validate_fraction(value: f64) -> Result<(), ValidationError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::new("must_be_fraction"))
    }
}

/// Validate that a source name is usable as a file stem and a snapshot key.
pub fn validate_source_name(name: &str) -> Result<(), ValidationError> {
    if SOURCE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_source_name"))
    }
}

/// Validate that no two sources share a name.
pub fn validate_unique_sources(sources: &[SourceConfig]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    if sources.iter().all(|s| seen.insert(s.name.as_str())) {
        Ok(())
    } else {
        Err(ValidationError::new("duplicate_source_name"))
    }
}

/// Validate log level.
pub fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid = ["trace", "debug", "info", "warn", "error"]
        .contains(&level.to_lowercase().as_str());
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_log_level"))
    }
}

/// Validate that a branch name is a single path segment.
pub fn validate_branch_name(name: &str) -> Result<(), ValidationError> {
    if validate_source_name(name).is_ok() && !name.starts_with('.') {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_branch_name"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_names() {
        assert!(validate_source_name("easyprivacy_general").is_ok());
        assert!(validate_source_name("ublock.privacy-2").is_ok());
        assert!(validate_source_name("../etc").is_err());
        assert!(validate_source_name("").is_err());
    }

    #[test]
    fn fractions() {
        assert!(validate_fraction(0.0).is_ok());
        assert!(validate_fraction(1.0).is_ok());
        assert!(validate_fraction(1.5).is_err());
    }

    #[test]
    fn branch_names() {
        assert!(validate_branch_name("main").is_ok());
        assert!(validate_branch_name(".hidden").is_err());
    }
}
