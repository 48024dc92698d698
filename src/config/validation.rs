//! Configuration errors and value helpers.

use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Expand environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
///
/// ```
/// use heatwatch::config::expand_env_vars;
///
/// assert_eq!(
///     expand_env_vars("sqlite://${HEATWATCH_DOC_UNSET:-data}/heatwatch.db"),
///     "sqlite://data/heatwatch.db"
/// );
/// ```
pub fn expand_env_vars(input: &str) -> String {
    static ENV_VAR_REGEX: std::sync::OnceLock<Option<regex::Regex>> = std::sync::OnceLock::new();

    let Some(regex) = ENV_VAR_REGEX
        .get_or_init(|| regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").ok())
    else {
        return input.to_string();
    };

    regex
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars_no_vars() {
        assert_eq!(
            expand_env_vars("sqlite://data/heatwatch.db"),
            "sqlite://data/heatwatch.db"
        );
    }

    #[test]
    fn test_expand_env_vars_with_default() {
        let result = expand_env_vars("sqlite://${NONEXISTENT_DIR_12345:-data}/heatwatch.db");
        assert_eq!(result, "sqlite://data/heatwatch.db");
    }

    #[test]
    fn test_expand_env_vars_missing_without_default() {
        assert_eq!(expand_env_vars("${NONEXISTENT_DIR_12345}/x.db"), "/x.db");
    }

    #[test]
    fn test_expand_env_vars_from_env() {
        // SAFETY: This test runs in isolation and only modifies a test-specific variable.
        unsafe {
            std::env::set_var("TEST_VAR_EXPAND", "/var/lib/heatwatch");
        }
        let result = expand_env_vars("sqlite://${TEST_VAR_EXPAND}/readings.db");
        assert_eq!(result, "sqlite:///var/lib/heatwatch/readings.db");
        // SAFETY: Cleanup test variable.
        unsafe {
            std::env::remove_var("TEST_VAR_EXPAND");
        }
    }
}
