use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;

use crate::config::{ImageBackend, ImageConfig};
use crate::dispatch::{ImageRef, MAX_IMAGE_BYTES, build_client, check_status, read_capped};
use crate::error::GenerationError;

/// Upper bound on a JSON images-API response carrying a base64 payload.
const MAX_IMAGES_RESPONSE_BYTES: usize = MAX_IMAGE_BYTES * 2;

/// Text-to-image provider used when the caller supplies no image.
#[async_trait]
pub trait ImageSynthesizer: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(&self, prompt: &str) -> Result<ImageRef, GenerationError>;
}

/// Resolves the pipeline's input image: identity for caller-supplied images,
/// otherwise exactly one text-to-image call. Never retries.
pub struct ImageSource {
    synthesizer: Option<Box<dyn ImageSynthesizer>>,
}

impl ImageSource {
    pub fn new(synthesizer: Option<Box<dyn ImageSynthesizer>>) -> Self {
        Self { synthesizer }
    }

    /// Source with no synthesizer: text-only requests never get an image.
    pub fn disabled() -> Self {
        Self { synthesizer: None }
    }

    pub fn from_config(config: &ImageConfig) -> Result<Self, GenerationError> {
        if !config.enabled {
            tracing::info!("image synthesis disabled by configuration");
            return Ok(Self::disabled());
        }
        let client = build_client()?;
        let synthesizer: Box<dyn ImageSynthesizer> = match config.backend {
            ImageBackend::Huggingface => Box::new(HuggingFaceSynthesizer::new(config.clone(), client)),
            ImageBackend::Openai => Box::new(OpenAiImagesSynthesizer::new(config.clone(), client)),
        };
        Ok(Self::new(Some(synthesizer)))
    }

    pub fn can_synthesize(&self) -> bool {
        self.synthesizer.is_some()
    }

    pub async fn resolve(
        &self,
        prompt: Option<&str>,
        supplied: Option<ImageRef>,
    ) -> Result<ImageRef, GenerationError> {
        if let Some(image) = supplied {
            return Ok(image);
        }

        let Some(synthesizer) = &self.synthesizer else {
            return Err(GenerationError::ImageSynthesisFailed {
                provider: "none".to_string(),
                message: "no text-to-image provider configured".to_string(),
            });
        };
        let prompt = prompt.filter(|p| !p.trim().is_empty()).ok_or_else(|| {
            GenerationError::ImageSynthesisFailed {
                provider: synthesizer.name().to_string(),
                message: "no prompt to synthesize from".to_string(),
            }
        })?;

        let start = Instant::now();
        match synthesizer.synthesize(prompt).await {
            Ok(image) => {
                tracing::info!(
                    provider = synthesizer.name(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "input image synthesized"
                );
                Ok(image)
            }
            Err(e @ GenerationError::ImageSynthesisFailed { .. }) => Err(e),
            Err(e) => Err(GenerationError::ImageSynthesisFailed {
                provider: synthesizer.name().to_string(),
                message: e.to_string(),
            }),
        }
    }
}

fn credential(config: &ImageConfig, name: &str) -> Result<String, GenerationError> {
    config
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| GenerationError::ProviderUnavailable {
            provider: name.to_string(),
            message: match &config.api_key_env {
                Some(var) => format!("{var} not set"),
                None => "no credential configured".to_string(),
            },
        })
}

// ---------------------------------------------------------------------------
// Hugging Face inference API (JSON in, binary image out)
// ---------------------------------------------------------------------------

pub struct HuggingFaceSynthesizer {
    config: ImageConfig,
    client: Client,
}

impl HuggingFaceSynthesizer {
    pub fn new(config: ImageConfig, client: Client) -> Self {
        Self { config, client }
    }

    fn url(&self) -> String {
        let base = self.config.endpoint.trim_end_matches('/');
        match &self.config.model {
            Some(model) => format!("{base}/{model}"),
            None => base.to_string(),
        }
    }
}

#[async_trait]
impl ImageSynthesizer for HuggingFaceSynthesizer {
    fn name(&self) -> &str {
        "huggingface"
    }

    async fn synthesize(&self, prompt: &str) -> Result<ImageRef, GenerationError> {
        let api_key = credential(&self.config, self.name())?;
        let body = serde_json::json!({
            "inputs": format!("{prompt}{}", self.config.prompt_suffix),
        });

        let response = self
            .client
            .post(self.url())
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Accept", "image/png")
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&body)
            .send()
            .await?;
        let response = check_status(self.name(), response, 4096).await?;

        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_lowercase())
            .unwrap_or_default();
        if !mime.starts_with("image/") {
            return Err(GenerationError::ImageSynthesisFailed {
                provider: self.name().to_string(),
                message: format!("expected an image payload, got '{mime}'"),
            });
        }

        let bytes = read_capped(self.name(), response, MAX_IMAGE_BYTES).await?;
        if bytes.is_empty() {
            return Err(GenerationError::ImageSynthesisFailed {
                provider: self.name().to_string(),
                message: "empty image payload".to_string(),
            });
        }
        Ok(ImageRef::inline(bytes, mime))
    }
}

// ---------------------------------------------------------------------------
// OpenAI / Azure OpenAI images API
// ---------------------------------------------------------------------------

pub struct OpenAiImagesSynthesizer {
    config: ImageConfig,
    client: Client,
}

impl OpenAiImagesSynthesizer {
    pub fn new(config: ImageConfig, client: Client) -> Self {
        Self { config, client }
    }

    /// First image in `data[]`, preferring an inline `b64_json` payload over a URL.
    pub fn parse_response(&self, body: &[u8]) -> Result<ImageRef, GenerationError> {
        let v: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| GenerationError::SchemaParse(format!("images response: {e}")))?;
        let first = &v["data"][0];
        if let Some(b64) = first["b64_json"].as_str() {
            let bytes = STANDARD
                .decode(b64)
                .map_err(|e| GenerationError::SchemaParse(format!("images b64_json: {e}")))?;
            if !bytes.is_empty() {
                return Ok(ImageRef::inline(bytes, "image/png"));
            }
        }
        if let Some(url) = first["url"].as_str().filter(|u| !u.is_empty()) {
            return Ok(ImageRef::Url(url.to_string()));
        }
        Err(GenerationError::ImageSynthesisFailed {
            provider: self.name().to_string(),
            message: "no image in response".to_string(),
        })
    }
}

#[async_trait]
impl ImageSynthesizer for OpenAiImagesSynthesizer {
    fn name(&self) -> &str {
        "openai-images"
    }

    async fn synthesize(&self, prompt: &str) -> Result<ImageRef, GenerationError> {
        let api_key = credential(&self.config, self.name())?;
        let mut body = serde_json::json!({
            "prompt": format!("{prompt}{}", self.config.prompt_suffix),
            "n": 1,
            "size": self.config.size.as_deref().unwrap_or("1024x1024"),
            "response_format": "b64_json",
        });
        if let Some(model) = &self.config.model {
            body["model"] = serde_json::Value::String(model.clone());
        }

        // Azure expects `api-key`; OpenAI expects a bearer token. Both are sent.
        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Authorization", format!("Bearer {api_key}"))
            .header("api-key", &api_key)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&body)
            .send()
            .await?;
        let response = check_status(self.name(), response, 4096).await?;
        let bytes = read_capped(self.name(), response, MAX_IMAGES_RESPONSE_BYTES).await?;
        self.parse_response(&bytes)
    }
}
