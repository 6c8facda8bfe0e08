//! Secret resolution for provider credentials and signing keys.
//!
//! Every secret in the config can come from three places, checked in order:
//! a direct value (local testing), a file (mounted container secrets), or
//! an environment variable. Empty strings count as "not configured".

use secrecy::SecretString;
use std::fs;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source configured for {what}")]
    NoSourceProvided { what: &'static str },

    #[error("Failed to read secret from file '{path}': {source}")]
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

/// Where one secret may be found.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecretSource<'a> {
    pub what: &'static str,
    pub direct: Option<&'a str>,
    pub file: Option<&'a str>,
    pub env_var: Option<&'a str>,
}

impl<'a> SecretSource<'a> {
    pub fn is_configured(&self) -> bool {
        [self.direct, self.file, self.env_var]
            .iter()
            .any(|s| s.is_some_and(|v| !v.is_empty()))
    }

    pub fn resolve(&self) -> Result<SecretString> {
        if let Some(value) = non_empty(self.direct) {
            return Ok(SecretString::from(value.to_string()));
        }

        if let Some(path) = non_empty(self.file) {
            let expanded = expand_home(path);
            let content = fs::read_to_string(&expanded).map_err(|e| SecretError::FileReadError {
                path: expanded.clone(),
                source: e,
            })?;
            return Ok(SecretString::from(content.trim().to_string()));
        }

        if let Some(name) = non_empty(self.env_var) {
            return match std::env::var(name) {
                Ok(value) => Ok(SecretString::from(value.trim().to_string())),
                Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                    name: name.to_string(),
                }),
                Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                    name: name.to_string(),
                }),
            };
        }

        Err(SecretError::NoSourceProvided { what: self.what })
    }

    /// Like [`resolve`](Self::resolve) but an unconfigured source is `None`.
    pub fn resolve_optional(&self) -> Result<Option<SecretString>> {
        match self.resolve() {
            Ok(secret) => Ok(Some(secret)),
            Err(SecretError::NoSourceProvided { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Resolves a secret from a direct value, a file, or an env var.
pub fn resolve_secret(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<SecretString> {
    SecretSource {
        what: "secret",
        direct,
        file: file_path,
        env_var,
    }
    .resolve()
}

/// Secrets the running service needs, resolved once at startup.
pub struct ServiceSecrets {
    pub provider_api_key: SecretString,
    pub media_signing_key: SecretString,
    pub webhook_secret: Option<SecretString>,
    pub analysis_token: Option<SecretString>,
}

impl ServiceSecrets {
    pub fn resolve(config: &Config) -> Result<Self> {
        let provider = &config.provider;
        let media = &config.media;
        Ok(Self {
            provider_api_key: SecretSource {
                what: "provider.api_key",
                direct: provider.api_key.as_deref(),
                file: provider.api_key_file.as_deref(),
                env_var: provider.api_key_env_var.as_deref(),
            }
            .resolve()?,
            media_signing_key: SecretSource {
                what: "media.signing_key",
                direct: media.signing_key.as_deref(),
                file: media.signing_key_file.as_deref(),
                env_var: media.signing_key_env_var.as_deref(),
            }
            .resolve()?,
            webhook_secret: SecretSource {
                what: "provider.webhook_secret",
                direct: provider.webhook_secret.as_deref(),
                file: None,
                env_var: provider.webhook_secret_env_var.as_deref(),
            }
            .resolve_optional()?,
            analysis_token: SecretSource {
                what: "analysis.token",
                direct: config.analysis.token.as_deref(),
                file: None,
                env_var: config.analysis.token_env_var.as_deref(),
            }
            .resolve_optional()?,
        })
    }
}

/// Expands a leading `~` or `~/` to the current user's home directory.
fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            let home = home.to_string_lossy();
            return path.replacen('~', &home, 1);
        }
    }
    path.to_string()
}
