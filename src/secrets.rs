//! Credential loading
//!
//! Broker tokens are read from the 1Password CLI when a reference is
//! configured, otherwise from the environment. Every secret is returned as
//! `Zeroizing<String>` so it is wiped from memory on drop.

use std::env;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

/// Error type for secret loading operations
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Secret not found: {0}")]
    NotFound(String),

    #[error("1Password CLI error: {0}")]
    OnePasswordError(String),

    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    #[error("Secret validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for secret loading
#[derive(Debug, Clone)]
pub struct SecretConfig {
    /// Whether secrets may come from plain environment variables.
    pub allow_env_vars: bool,

    /// Whether a failing 1Password lookup is fatal.
    pub require_op_cli: bool,
}

impl Default for SecretConfig {
    fn default() -> Self {
        Self {
            allow_env_vars: true,
            require_op_cli: false,
        }
    }
}

/// Load a secret, trying the 1Password reference first when one is given.
///
/// ```no_run
/// use fxbot::secrets::{load_secret, SecretConfig};
///
/// let token = load_secret("OANDA_API_TOKEN", None, &SecretConfig::default());
/// ```
pub fn load_secret(
    env_var_name: &str,
    op_reference: Option<&str>,
    config: &SecretConfig,
) -> Result<Zeroizing<String>, SecretError> {
    if let Some(reference) = op_reference {
        match load_from_op_cli(reference) {
            Ok(secret) => {
                info!("Loaded secret from 1Password CLI: {}", env_var_name);
                return Ok(secret);
            }
            Err(e) => {
                if config.require_op_cli {
                    error!("1Password CLI required but failed: {}", e);
                    return Err(e);
                }
                warn!("1Password CLI not available: {}", e);
            }
        }
    }

    if config.allow_env_vars {
        load_from_env(env_var_name)
    } else {
        error!(
            "Secret loading failed: no 1Password reference and env vars disabled for {}",
            env_var_name
        );
        Err(SecretError::NotFound(env_var_name.to_string()))
    }
}

fn load_from_op_cli(reference: &str) -> Result<Zeroizing<String>, SecretError> {
    use std::process::Command;

    let output = Command::new("op")
        .arg("read")
        .arg(reference)
        .output()
        .map_err(|e| SecretError::OnePasswordError(format!("Failed to execute 'op': {}", e)))?;

    if !output.status.success() {
        let error_msg = String::from_utf8_lossy(&output.stderr);
        return Err(SecretError::OnePasswordError(format!(
            "1Password CLI failed: {}",
            error_msg
        )));
    }

    let secret = String::from_utf8(output.stdout)
        .map_err(|e| SecretError::OnePasswordError(format!("Invalid UTF-8 from 1Password: {}", e)))?
        .trim()
        .to_string();

    if secret.is_empty() {
        return Err(SecretError::OnePasswordError(
            "1Password returned empty secret".to_string(),
        ));
    }

    Ok(Zeroizing::new(secret))
}

fn load_from_env(env_var_name: &str) -> Result<Zeroizing<String>, SecretError> {
    match env::var(env_var_name) {
        Ok(value) if !value.trim().is_empty() => Ok(Zeroizing::new(value.trim().to_string())),
        _ => Err(SecretError::EnvVarNotSet(env_var_name.to_string())),
    }
}

/// Rejects secrets that are too short or obviously placeholders.
pub fn validate_secret_strength(secret: &str, min_length: usize) -> Result<(), SecretError> {
    if secret.len() < min_length {
        return Err(SecretError::ValidationFailed(format!(
            "Secret too short: {} characters (minimum: {})",
            secret.len(),
            min_length
        )));
    }

    let weak_patterns = ["changeme", "placeholder", "your_token", "xxxxxxxx"];
    let secret_lower = secret.to_lowercase();
    for pattern in &weak_patterns {
        if secret_lower.contains(pattern) {
            return Err(SecretError::ValidationFailed(format!(
                "Secret contains placeholder pattern: {}",
                pattern
            )));
        }
    }

    Ok(())
}

/// Load a broker API token and check it looks real.
pub fn load_api_token(
    env_var_name: &str,
    op_reference: Option<&str>,
    config: &SecretConfig,
) -> Result<Zeroizing<String>, SecretError> {
    let secret = load_secret(env_var_name, op_reference, config)?;
    validate_secret_strength(&secret, 20)?;
    Ok(secret)
}
