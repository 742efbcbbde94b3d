//! Org access token resolution.
//!
//! An org endpoint names its token in one of three ways, checked in order:
//!
//! 1. **Direct value** (`access_token`), for local testing
//! 2. **File reference** (`access_token_file`), e.g. a mounted secret
//! 3. **Env var reference** (`access_token_env_var`)

use std::fs;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Error type for token resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No token source provided (need one of: access_token, access_token_file, access_token_env_var)")]
    NoSourceProvided,

    #[error("Failed to read token from file '{path}': {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Where an org access token comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token_env_var: Option<String>,
}

impl TokenSource {
    /// True when at least one non-empty source is configured.
    pub fn is_configured(&self) -> bool {
        [
            &self.access_token,
            &self.access_token_file,
            &self.access_token_env_var,
        ]
        .iter()
        .any(|s| s.as_deref().is_some_and(|v| !v.is_empty()))
    }

    pub fn resolve(&self) -> Result<SecretString> {
        resolve_secret(
            self.access_token.as_deref(),
            self.access_token_file.as_deref(),
            self.access_token_env_var.as_deref(),
        )
    }
}

/// Resolves a secret from the first non-empty source. File and env var
/// contents are trimmed.
pub fn resolve_secret(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<SecretString> {
    if let Some(value) = direct.filter(|v| !v.is_empty()) {
        return Ok(SecretString::from(value.to_string()));
    }

    if let Some(path) = file_path.filter(|p| !p.is_empty()) {
        let expanded = expand_home(path);
        return fs::read_to_string(&expanded)
            .map(|content| SecretString::from(content.trim().to_string()))
            .map_err(|e| SecretError::FileReadError {
                path: expanded,
                source: e,
            });
    }

    if let Some(var_name) = env_var.filter(|n| !n.is_empty()) {
        return match std::env::var(var_name) {
            Ok(value) => Ok(SecretString::from(value.trim())),
            Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                name: var_name.to_string(),
            }),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                name: var_name.to_string(),
            }),
        };
    }

    Err(SecretError::NoSourceProvided)
}

/// Expands a leading `~` to the home directory. `~user` is not supported.
fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    #[serial]
    fn test_direct_value_takes_priority() {
        std::env::set_var("ORGPUSH_TEST_TOKEN_1", "env_value");
        let result = resolve_secret(Some("direct"), None, Some("ORGPUSH_TEST_TOKEN_1")).unwrap();
        assert_eq!(result.expose_secret(), "direct");
        std::env::remove_var("ORGPUSH_TEST_TOKEN_1");
    }

    #[test]
    #[serial]
    fn test_file_takes_priority_over_env() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "  file_token ").unwrap();

        std::env::set_var("ORGPUSH_TEST_TOKEN_2", "env_value");
        let source = TokenSource {
            access_token: None,
            access_token_file: Some(temp_file.path().to_string_lossy().into_owned()),
            access_token_env_var: Some("ORGPUSH_TEST_TOKEN_2".to_string()),
        };
        assert_eq!(source.resolve().unwrap().expose_secret(), "file_token");
        std::env::remove_var("ORGPUSH_TEST_TOKEN_2");
    }

    #[test]
    #[serial]
    fn test_env_var_fallback_ignores_empty_sources() {
        std::env::set_var("ORGPUSH_TEST_TOKEN_3", "env_value\n");
        let result = resolve_secret(Some(""), Some(""), Some("ORGPUSH_TEST_TOKEN_3")).unwrap();
        assert_eq!(result.expose_secret(), "env_value");
        std::env::remove_var("ORGPUSH_TEST_TOKEN_3");
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            resolve_secret(None, None, None),
            Err(SecretError::NoSourceProvided)
        ));
        assert!(matches!(
            resolve_secret(None, Some("/nonexistent/orgpush/token"), None),
            Err(SecretError::FileReadError { .. })
        ));
        assert!(matches!(
            resolve_secret(None, None, Some("ORGPUSH_TEST_TOKEN_UNSET_XYZ")),
            Err(SecretError::EnvVarNotSet { .. })
        ));
    }

    #[test]
    fn test_is_configured() {
        assert!(!TokenSource::default().is_configured());
        let source = TokenSource {
            access_token: Some(String::new()),
            access_token_env_var: Some("X".to_string()),
            ..Default::default()
        };
        assert!(source.is_configured());
    }

    #[test]
    fn test_expand_home() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_home("~"), home.to_string_lossy());
        assert!(expand_home("~/token").ends_with("/token"));
        assert_eq!(expand_home("/abs/token"), "/abs/token");
    }
}
