//! Settings file for the copy pipeline.

use std::fs;
use std::path::Path;
use std::time::Duration;

use imgbundle_oci::RegistryAuth;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Upper bound on in-flight registry and archive operations.
    pub concurrency: usize,
    /// Copy foreign/non-distributable layers instead of skipping them.
    pub include_non_distributable_layers: bool,
    /// Probe for signature, SBOM and attestation images.
    pub fetch_artifacts: bool,
    pub retry: RetrySettings,
    pub registry: RegistrySettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub attempts: usize,
    pub backoff_ms: u64,
}

/// Names of the environment variables holding registry credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub username_env: String,
    pub password_env: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            include_non_distributable_layers: false,
            fetch_artifacts: true,
            retry: RetrySettings::default(),
            registry: RegistrySettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff_ms: 1000,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            username_env: "IMGBUNDLE_REGISTRY_USERNAME".to_string(),
            password_env: "IMGBUNDLE_REGISTRY_PASSWORD".to_string(),
        }
    }
}

impl Settings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.attempts,
            Duration::from_millis(self.retry.backoff_ms),
        )
    }

    pub fn registry_auth(&self) -> RegistryAuth {
        RegistryAuth::from_env_vars(&self.registry.username_env, &self.registry.password_env)
    }
}

/// Load settings from a YAML (or JSON, by extension) file.
pub fn load_settings(path: &Path) -> Result<Settings> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let settings: Settings = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid JSON settings {}: {}", path.display(), e)))?
    } else {
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid YAML settings {}: {}", path.display(), e)))?
    };

    validate_settings(&settings)?;
    Ok(settings)
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.concurrency == 0 {
        return Err(Error::Config("concurrency must be at least 1".into()));
    }
    if settings.retry.attempts == 0 {
        return Err(Error::Config("retry.attempts must be at least 1".into()));
    }
    if settings.registry.username_env.trim().is_empty()
        || settings.registry.password_env.trim().is_empty()
    {
        return Err(Error::Config(
            "registry.username_env and registry.password_env cannot be empty".into(),
        ));
    }
    Ok(())
}
