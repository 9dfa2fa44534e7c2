use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

use crate::config::{Config, ConfigError};
use crate::dispatch::async_poll::AsyncPollDispatch;
use crate::dispatch::http::HttpDispatch;
use crate::dispatch::session::SessionDispatch;
use crate::dispatch::{InputKind, ProviderAdapter, build_client};
use crate::error::GenerationError;

/// Discriminant for submit-then-poll provider APIs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncPollProviderType {
    /// Tripo3D: upload → image_to_model task → poll.
    Tripo3d,
    /// Replicate predictions: create → poll (text prompt input).
    Replicate,
}

/// One named argument of a session-protocol predict call.
/// Arguments are sent positionally in the order they are listed.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SessionParam {
    pub name: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

fn default_image_field() -> String {
    "image".to_string()
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    60
}

fn default_progress_low() -> u8 {
    30
}

fn default_progress_high() -> u8 {
    90
}

/// Backend-specific configuration. Prevents invalid states
/// (e.g., a poll entry with multipart form fields).
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    SyncHttp {
        #[serde(default = "default_image_field")]
        image_field: String,
        #[serde(default)]
        form_fields: BTreeMap<String, String>,
        /// JSON pointers tried in order; empty means the built-in list.
        #[serde(default)]
        reference_paths: Vec<String>,
    },
    AsyncPoll {
        api: AsyncPollProviderType,
        /// Provider-side model or version identifier.
        #[serde(default)]
        model: Option<String>,
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
        #[serde(default = "default_progress_low")]
        progress_low: u8,
        #[serde(default = "default_progress_high")]
        progress_high: u8,
    },
    Session {
        api_name: String,
        /// Parameter slot that receives the uploaded image.
        #[serde(default)]
        image_param: Option<String>,
        /// Parameter slot that receives the prompt.
        #[serde(default)]
        prompt_param: Option<String>,
        #[serde(default)]
        params: Vec<SessionParam>,
        #[serde(default)]
        reference_paths: Vec<String>,
    },
}

impl BackendConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SyncHttp { .. } => "sync_http",
            Self::AsyncPoll { .. } => "async_poll",
            Self::Session { .. } => "session",
        }
    }

    pub fn input(&self) -> InputKind {
        match self {
            Self::SyncHttp { .. } => InputKind::Image,
            Self::AsyncPoll { api, .. } => match api {
                AsyncPollProviderType::Tripo3d => InputKind::Image,
                AsyncPollProviderType::Replicate => InputKind::Prompt,
            },
            Self::Session { image_param, .. } => {
                if image_param.is_some() {
                    InputKind::Image
                } else {
                    InputKind::Prompt
                }
            }
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    180
}

#[derive(Clone, Deserialize)]
pub struct ProviderEntry {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub endpoint: String,
    /// Inline credential. Takes precedence over `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the credential.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Public endpoints (e.g. open Spaces) work without a credential.
    #[serde(default)]
    pub credential_optional: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(flatten)]
    pub backend: BackendConfig,
}

impl ProviderEntry {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn input(&self) -> InputKind {
        self.backend.input()
    }

    pub fn has_credential(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    /// Credential for this call, or `ProviderUnavailable` when a required one is missing.
    pub fn credential(&self) -> Result<Option<&str>, GenerationError> {
        match self.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            Some(key) => Ok(Some(key)),
            None if self.credential_optional => Ok(None),
            None => Err(GenerationError::ProviderUnavailable {
                provider: self.id.clone(),
                message: match &self.api_key_env {
                    Some(var) => format!("{var} not set"),
                    None => "no credential configured".to_string(),
                },
            }),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(format!("provider {}: {msg}", self.id)));
        if self.id.trim().is_empty() {
            return Err(ConfigError::Invalid("provider id must not be empty".into()));
        }
        if self.timeout_secs == 0 {
            return invalid("timeout_secs must be positive".into());
        }
        match &self.backend {
            BackendConfig::AsyncPoll {
                poll_interval_ms,
                max_attempts,
                progress_low,
                progress_high,
                ..
            } => {
                if *poll_interval_ms == 0 {
                    return invalid("poll_interval_ms must be positive".into());
                }
                if *max_attempts == 0 {
                    return invalid("max_attempts must be positive".into());
                }
                if progress_low >= progress_high || *progress_high > 100 {
                    return invalid(format!(
                        "progress range {progress_low}..{progress_high} must be increasing and within 0..100"
                    ));
                }
            }
            BackendConfig::Session {
                api_name,
                image_param,
                prompt_param,
                ..
            } => {
                if api_name.trim().is_empty() {
                    return invalid("api_name must not be empty".into());
                }
                if image_param.is_none() && prompt_param.is_none() {
                    return invalid("session needs image_param or prompt_param".into());
                }
            }
            BackendConfig::SyncHttp { image_field, .. } => {
                if image_field.trim().is_empty() {
                    return invalid("image_field must not be empty".into());
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("id", &self.id)
            .field("enabled", &self.enabled)
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_key_env", &self.api_key_env)
            .field("timeout_secs", &self.timeout_secs)
            .field("backend", &self.backend)
            .finish()
    }
}

/// Ensure provider ids are unique.
pub(crate) fn check_unique_ids(entries: &[ProviderEntry]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for entry in entries {
        if !seen.insert(entry.id.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate provider id: {}",
                entry.id
            )));
        }
    }
    Ok(())
}

/// Ordered adapter list built from configuration.
pub struct Registry {
    entries: Vec<ProviderEntry>,
    adapters: Vec<Arc<dyn ProviderAdapter>>,
}

impl Registry {
    pub fn from_config(config: &Config) -> Result<Self, GenerationError> {
        let client = build_client()?;
        let adapters = config
            .providers
            .iter()
            .filter(|entry| {
                if !entry.enabled {
                    tracing::info!(provider = entry.id, "provider disabled by configuration");
                }
                entry.enabled
            })
            .map(|entry| Self::adapter_for(entry, &client, config))
            .collect();

        Ok(Self {
            entries: config.providers.clone(),
            adapters,
        })
    }

    /// Build a registry from pre-built adapters, in priority order.
    pub fn from_adapters(adapters: Vec<Arc<dyn ProviderAdapter>>) -> Self {
        Self {
            entries: Vec::new(),
            adapters,
        }
    }

    fn adapter_for(entry: &ProviderEntry, client: &Client, config: &Config) -> Arc<dyn ProviderAdapter> {
        match &entry.backend {
            BackendConfig::SyncHttp { .. } => Arc::new(HttpDispatch::new(
                entry.clone(),
                client.clone(),
                config.pipeline.output_dir.clone(),
            )),
            BackendConfig::AsyncPoll { .. } => {
                Arc::new(AsyncPollDispatch::new(entry.clone(), client.clone()))
            }
            BackendConfig::Session { .. } => {
                Arc::new(SessionDispatch::new(entry.clone(), client.clone()))
            }
        }
    }

    /// Enabled adapters in priority order.
    pub fn adapters(&self) -> &[Arc<dyn ProviderAdapter>] {
        &self.adapters
    }

    /// Every configured entry, enabled or not, in priority order.
    pub fn entries(&self) -> &[ProviderEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&ProviderEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn any_needs_image(&self) -> bool {
        self.adapters.iter().any(|a| a.input() == InputKind::Image)
    }
}
