//! API token lookup for the remote transcription service.
//!
//! The token can be given in three ways, checked in this order:
//!
//! 1. inline in the config (`token`), for quick local runs
//! 2. a file (`token_file`), for mounted secrets
//! 3. an environment variable (`token_env_var`)
//!
//! Worker requests carry the engine config, not the resolved token. File
//! and environment references are resolved by each worker process.

use std::fs;
use std::path::PathBuf;

use secrecy::SecretString;

use crate::config::RemoteEngineConfig;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Failed to read token file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Token file '{path}' is empty")]
    EmptyFile { path: PathBuf },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// The token for `config`, or `None` when the service is unauthenticated.
///
/// A reference that is configured but unusable (missing file, unset
/// variable) is an error rather than a silent anonymous request.
pub fn resolve_token(config: &RemoteEngineConfig) -> Result<Option<SecretString>, SecretError> {
    if let Some(token) = non_empty(&config.token) {
        return Ok(Some(SecretString::from(token.to_string())));
    }

    if let Some(path) = non_empty(&config.token_file) {
        let path = expand_home(path);
        let content = fs::read_to_string(&path).map_err(|e| SecretError::FileRead {
            path: path.clone(),
            source: e,
        })?;
        let token = content.trim();
        if token.is_empty() {
            return Err(SecretError::EmptyFile { path });
        }
        return Ok(Some(SecretString::from(token.to_string())));
    }

    if let Some(name) = non_empty(&config.token_env_var) {
        return match std::env::var(name) {
            Ok(value) => Ok(Some(SecretString::from(value.trim().to_string()))),
            Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                name: name.to_string(),
            }),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                name: name.to_string(),
            }),
        };
    }

    Ok(None)
}

/// Expands a leading `~` or `~/`. `~user` forms are left alone.
fn expand_home(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return match path.strip_prefix("~/") {
                Some(rest) => home.join(rest),
                None => home,
            };
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn remote(token: Option<&str>, file: Option<&str>, env: Option<&str>) -> RemoteEngineConfig {
        RemoteEngineConfig {
            url: "http://gpu-box:8000".to_string(),
            token: token.map(str::to_string),
            token_file: file.map(str::to_string),
            token_env_var: env.map(str::to_string),
            ..Default::default()
        }
    }

    fn resolved(config: &RemoteEngineConfig) -> Option<String> {
        resolve_token(config)
            .unwrap()
            .map(|t| t.expose_secret().to_string())
    }

    // Tests that touch the environment run serially
    #[test]
    #[serial]
    fn test_inline_token_wins() {
        std::env::set_var("MEDIASCRIBE_TEST_TOKEN_1", "from-env");
        let config = remote(Some("inline"), None, Some("MEDIASCRIBE_TEST_TOKEN_1"));
        assert_eq!(resolved(&config).as_deref(), Some("inline"));
        std::env::remove_var("MEDIASCRIBE_TEST_TOKEN_1");
    }

    #[test]
    #[serial]
    fn test_file_before_env() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "  from-file  ").unwrap();
        std::env::set_var("MEDIASCRIBE_TEST_TOKEN_2", "from-env");

        let config = remote(
            None,
            Some(file.path().to_str().unwrap()),
            Some("MEDIASCRIBE_TEST_TOKEN_2"),
        );
        assert_eq!(resolved(&config).as_deref(), Some("from-file"));
        std::env::remove_var("MEDIASCRIBE_TEST_TOKEN_2");
    }

    #[test]
    #[serial]
    fn test_env_fallback_and_blank_references() {
        std::env::set_var("MEDIASCRIBE_TEST_TOKEN_3", "from-env\n");
        let config = remote(Some(""), Some("  "), Some("MEDIASCRIBE_TEST_TOKEN_3"));
        assert_eq!(resolved(&config).as_deref(), Some("from-env"));
        std::env::remove_var("MEDIASCRIBE_TEST_TOKEN_3");
    }

    #[test]
    fn test_no_reference_means_anonymous() {
        let config = remote(None, None, None);
        assert!(resolved(&config).is_none());
    }

    #[test]
    fn test_broken_references_are_errors() {
        let missing = remote(None, Some("/nonexistent/mediascribe/token"), None);
        assert!(matches!(resolve_token(&missing), Err(SecretError::FileRead { .. })));

        let empty = NamedTempFile::new().unwrap();
        let blank = remote(None, Some(empty.path().to_str().unwrap()), None);
        assert!(matches!(resolve_token(&blank), Err(SecretError::EmptyFile { .. })));

        let unset = remote(None, None, Some("MEDIASCRIBE_DEFINITELY_UNSET_12345"));
        assert!(matches!(resolve_token(&unset), Err(SecretError::EnvVarNotSet { .. })));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/etc/token"), PathBuf::from("/etc/token"));
        assert_eq!(expand_home("relative/token"), PathBuf::from("relative/token"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/token"), home.join("token"));
            assert_eq!(expand_home("~"), home);
        }
    }
}
