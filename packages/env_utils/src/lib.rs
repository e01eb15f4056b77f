#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Runtime environment variable lookups with defaults.
//!
//! Unset variables fall back to the given default. Variables that are set but
//! do not parse are reported as errors instead of silently using the default.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OptionEnvError {
    #[error("Invalid value for environment variable {name}: {source}")]
    ParseInt {
        name: String,
        source: std::num::ParseIntError,
    },
}

fn parse_var<T>(name: &str, value: &str) -> Result<T, OptionEnvError>
where
    T: std::str::FromStr<Err = std::num::ParseIntError>,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|source| OptionEnvError::ParseInt {
            name: name.to_string(),
            source,
        })
}

/// Returns the variable's value, or `None` if it is unset or empty.
#[must_use]
pub fn option_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|x| !x.trim().is_empty())
}

#[must_use]
pub fn default_env(name: &str, default: &str) -> String {
    option_env(name).unwrap_or_else(|| default.to_string())
}

/// # Errors
///
/// * If the variable is set but encounters an invalid digit
pub fn option_env_usize(name: &str) -> Result<Option<usize>, OptionEnvError> {
    option_env(name).map(|x| parse_var(name, &x)).transpose()
}

/// # Errors
///
/// * If the variable is set but encounters an invalid digit
pub fn option_env_u64(name: &str) -> Result<Option<u64>, OptionEnvError> {
    option_env(name).map(|x| parse_var(name, &x)).transpose()
}

/// # Errors
///
/// * If the variable is set but encounters an invalid digit or overflows a `u16`
pub fn option_env_u16(name: &str) -> Result<Option<u16>, OptionEnvError> {
    option_env(name).map(|x| parse_var(name, &x)).transpose()
}

/// # Errors
///
/// * If the variable is set but encounters an invalid digit
pub fn default_env_usize(name: &str, default: usize) -> Result<usize, OptionEnvError> {
    Ok(option_env_usize(name)?.unwrap_or(default))
}

/// # Errors
///
/// * If the variable is set but encounters an invalid digit
pub fn default_env_u64(name: &str, default: u64) -> Result<u64, OptionEnvError> {
    Ok(option_env_u64(name)?.unwrap_or(default))
}

/// # Errors
///
/// * If the variable is set but encounters an invalid digit or overflows a `u16`
pub fn default_env_u16(name: &str, default: u16) -> Result<u16, OptionEnvError> {
    Ok(option_env_u16(name)?.unwrap_or(default))
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn set(name: &str, value: &str) {
        // SAFETY: every test sets a variable name no other test reads.
        unsafe { std::env::set_var(name, value) };
    }

    #[test_log::test]
    fn default_env_falls_back_when_unset() {
        assert_eq!(
            default_env("PULSEFORM_TEST_DEFAULT_ENV_UNSET", "fallback"),
            "fallback"
        );
    }

    #[test_log::test]
    fn default_env_falls_back_when_blank() {
        set("PULSEFORM_TEST_DEFAULT_ENV_BLANK", "   ");

        assert_eq!(
            default_env("PULSEFORM_TEST_DEFAULT_ENV_BLANK", "fallback"),
            "fallback"
        );
    }

    #[test_log::test]
    fn default_env_returns_value_when_set() {
        set("PULSEFORM_TEST_DEFAULT_ENV_SET", "value");

        assert_eq!(default_env("PULSEFORM_TEST_DEFAULT_ENV_SET", "fallback"), "value");
    }

    #[test_log::test]
    fn default_env_u16_parses_value() {
        set("PULSEFORM_TEST_U16", " 8080 ");

        assert_eq!(default_env_u16("PULSEFORM_TEST_U16", 3000).unwrap(), 8080);
    }

    #[test_log::test]
    fn default_env_u16_rejects_overflow() {
        set("PULSEFORM_TEST_U16_OVERFLOW", "70000");

        let err = default_env_u16("PULSEFORM_TEST_U16_OVERFLOW", 3000).unwrap_err();

        assert!(err.to_string().contains("PULSEFORM_TEST_U16_OVERFLOW"));
    }

    #[test_log::test]
    fn option_env_usize_is_none_when_unset() {
        assert_eq!(option_env_usize("PULSEFORM_TEST_USIZE_UNSET").unwrap(), None);
    }

    #[test_log::test]
    fn default_env_u64_rejects_invalid_digit() {
        set("PULSEFORM_TEST_U64_INVALID", "12a");

        assert!(default_env_u64("PULSEFORM_TEST_U64_INVALID", 1).is_err());
    }
}
