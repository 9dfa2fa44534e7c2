use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::dispatch::registry::{
    AsyncPollProviderType, BackendConfig, ProviderEntry, SessionParam, check_unique_ids,
};

/// Config file looked up in the working directory when `MESHFORGE_CONFIG` is unset.
pub const DEFAULT_CONFIG_FILE: &str = "meshforge.toml";

pub const DEFAULT_BIND: &str = "127.0.0.1:8787";

pub const DEFAULT_PROMPT_SUFFIX: &str =
    ", 3D render, white background, product photography, high quality";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Where binary model payloads returned by synchronous providers are written.
    pub output_dir: PathBuf,
    /// Prefix of the canned fallback shapes (`{base}/cube.glb`).
    pub fallback_base: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(".meshforge/models"),
            fallback_base: "/models/fallback".to_string(),
        }
    }
}

/// Text-to-image backend used when the caller supplies no image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageBackend {
    /// Hugging Face inference API: JSON in, binary image out.
    Huggingface,
    /// OpenAI / Azure OpenAI images API: JSON in, `b64_json` or `url` out.
    Openai,
}

fn default_true() -> bool {
    true
}

fn default_prompt_suffix() -> String {
    DEFAULT_PROMPT_SUFFIX.to_string()
}

fn default_image_timeout_secs() -> u64 {
    60
}

#[derive(Clone, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub backend: ImageBackend,
    pub endpoint: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_prompt_suffix")]
    pub prompt_suffix: String,
    #[serde(default = "default_image_timeout_secs")]
    pub timeout_secs: u64,
    /// Requested output size for the OpenAI backend.
    #[serde(default)]
    pub size: Option<String>,
}

impl std::fmt::Debug for ImageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageConfig")
            .field("enabled", &self.enabled)
            .field("backend", &self.backend)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_key_env", &self.api_key_env)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: ImageBackend::Huggingface,
            endpoint: "https://api-inference.huggingface.co/models".to_string(),
            model: Some("stabilityai/stable-diffusion-2-1".to_string()),
            api_key: None,
            api_key_env: Some("HUGGINGFACE_TOKEN".to_string()),
            prompt_suffix: default_prompt_suffix(),
            timeout_secs: default_image_timeout_secs(),
            size: None,
        }
    }
}

#[derive(Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    pipeline: PipelineConfig,
    #[serde(default)]
    image: Option<ImageConfig>,
    #[serde(default)]
    providers: Option<Vec<ProviderEntry>>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub pipeline: PipelineConfig,
    pub image: ImageConfig,
    /// Providers in priority order.
    pub providers: Vec<ProviderEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            pipeline: PipelineConfig::default(),
            image: ImageConfig::default(),
            providers: default_providers(),
        }
    }
}

impl Config {
    /// Load from `MESHFORGE_CONFIG` (must exist) or `./meshforge.toml` (optional),
    /// then apply environment overrides and resolve credentials.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var("MESHFORGE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    tracing::info!("no {DEFAULT_CONFIG_FILE} found, using built-in providers");
                    Self::default()
                }
            }
        };

        if let Ok(bind) = env::var("MESHFORGE_BIND") {
            config.server.bind = bind;
        }

        config.resolve_credentials(|name| env::var(name).ok());
        config.warn_missing_credentials();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loading config");
        Self::from_toml_str(&text)
    }

    /// Parse a TOML document. Missing sections fall back to defaults;
    /// a missing `[[providers]]` list means the built-in provider chain.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        let config = Self {
            server: raw.server,
            pipeline: raw.pipeline,
            image: raw.image.unwrap_or_default(),
            providers: raw.providers.unwrap_or_else(default_providers),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unique_ids(&self.providers)?;
        for entry in &self.providers {
            entry.validate()?;
        }
        if self.image.enabled && self.image.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "image.timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Fill credentials from `api_key_env` where no inline key is set.
    pub fn resolve_credentials<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for entry in &mut self.providers {
            if entry.api_key.is_none()
                && let Some(var) = &entry.api_key_env
            {
                entry.api_key = lookup(var).filter(|v| !v.trim().is_empty());
            }
        }
        if self.image.api_key.is_none()
            && let Some(var) = &self.image.api_key_env
        {
            self.image.api_key = lookup(var).filter(|v| !v.trim().is_empty());
        }
    }

    fn warn_missing_credentials(&self) {
        for entry in self.providers.iter().filter(|e| e.enabled) {
            if !entry.has_credential() && !entry.credential_optional {
                tracing::warn!(
                    provider = entry.id,
                    env = entry.api_key_env.as_deref().unwrap_or("-"),
                    "credential not set, provider will be skipped"
                );
            }
        }
        if self.image.enabled && self.image.api_key.is_none() {
            tracing::warn!(
                env = self.image.api_key_env.as_deref().unwrap_or("-"),
                "image credential not set, text-only requests skip image providers"
            );
        }
        if !self.providers.iter().any(|e| e.enabled) {
            tracing::warn!("no providers enabled, every request uses procedural fallback");
        }
    }
}

/// Built-in provider chain, highest priority first.
pub fn default_providers() -> Vec<ProviderEntry> {
    vec![
        ProviderEntry {
            id: "stable-fast-3d".to_string(),
            enabled: true,
            endpoint: "https://hf.space/embed/stabilityai/stable-fast-3d/api/predict".to_string(),
            api_key: None,
            api_key_env: Some("HUGGINGFACE_TOKEN".to_string()),
            credential_optional: false,
            timeout_secs: 120,
            backend: BackendConfig::SyncHttp {
                image_field: "image".to_string(),
                form_fields: BTreeMap::from([
                    ("foreground_ratio".to_string(), "0.85".to_string()),
                    ("texture_resolution".to_string(), "1024".to_string()),
                ]),
                reference_paths: Vec::new(),
            },
        },
        ProviderEntry {
            id: "tripo3d".to_string(),
            enabled: true,
            endpoint: "https://api.tripo3d.ai/v2/openapi".to_string(),
            api_key: None,
            api_key_env: Some("TRIPO_API_KEY".to_string()),
            credential_optional: false,
            timeout_secs: 330,
            backend: BackendConfig::AsyncPoll {
                api: AsyncPollProviderType::Tripo3d,
                model: None,
                poll_interval_ms: 5_000,
                max_attempts: 60,
                progress_low: 30,
                progress_high: 90,
            },
        },
        ProviderEntry {
            id: "hunyuan3d".to_string(),
            enabled: true,
            endpoint: "https://tencent-hunyuan3d-2.hf.space".to_string(),
            api_key: None,
            api_key_env: Some("HUGGINGFACE_TOKEN".to_string()),
            credential_optional: true,
            timeout_secs: 150,
            backend: BackendConfig::Session {
                api_name: "shape_generation".to_string(),
                image_param: Some("image".to_string()),
                prompt_param: None,
                params: vec![
                    SessionParam {
                        name: "caption".to_string(),
                        value: serde_json::Value::Null,
                    },
                    SessionParam {
                        name: "image".to_string(),
                        value: serde_json::Value::Null,
                    },
                    SessionParam {
                        name: "steps".to_string(),
                        value: serde_json::json!(30),
                    },
                    SessionParam {
                        name: "guidance_scale".to_string(),
                        value: serde_json::json!(5.0),
                    },
                    SessionParam {
                        name: "seed".to_string(),
                        value: serde_json::json!(1234),
                    },
                    SessionParam {
                        name: "octree_resolution".to_string(),
                        value: serde_json::json!(256),
                    },
                    SessionParam {
                        name: "check_box_rembg".to_string(),
                        value: serde_json::json!(true),
                    },
                ],
                reference_paths: Vec::new(),
            },
        },
        ProviderEntry {
            id: "replicate-shap-e".to_string(),
            enabled: true,
            endpoint: "https://api.replicate.com/v1".to_string(),
            api_key: None,
            api_key_env: Some("REPLICATE_API_TOKEN".to_string()),
            credential_optional: false,
            timeout_secs: 150,
            backend: BackendConfig::AsyncPoll {
                api: AsyncPollProviderType::Replicate,
                model: Some(
                    "5957069d5c509126a73c7cb68abcddbb985aeefa4d318e7c63ec1352ce6da68c".to_string(),
                ),
                poll_interval_ms: 2_000,
                max_attempts: 60,
                progress_low: 30,
                progress_high: 90,
            },
        },
    ]
}
